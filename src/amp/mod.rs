//! # Automatic mixed precision utilities
//!
//! Mixed precision convolution kernels run fastest on channel-last data.
//! [`convert_module_format`] prepares a whole network for them by switching
//! every tensor it owns to `nhwc`.
//!
//! ```rust
//! use rusty_amp::amp::convert_module_format;
//! use rusty_amp::format::Format;
//! use rusty_amp::nn::{named_tensors, Conv2d};
//!
//! let mut conv = Conv2d::new(4, 4, (3, 3)).unwrap();
//! let converted = convert_module_format(&mut conv, false).unwrap().into_owned();
//! for (_, tensor) in named_tensors(&converted).unwrap() {
//!     assert_eq!(tensor.format(), Format::Nhwc);
//! }
//! ```

pub mod convert_format;

pub use convert_format::{
    convert_module_format, convert_module_format_to, convert_module_with, convert_tensor_format,
    ConversionReport,
};
