//! # rusty_amp: layout-aware neural network modules
//!
//! **rusty_amp** models networks as trees of modules that own layout-tagged
//! tensors, and provides the mixed-precision utility that converts a whole
//! tree to a memory layout such as `nhwc`.
//!
//! ## Usage Example
//!
//! ```rust
//! use rusty_amp::amp::convert_module_format;
//! use rusty_amp::format::Format;
//! use rusty_amp::nn::{named_tensors, BatchNorm2d, Conv2d};
//! use rusty_amp::tensor::{Parameter, Tensor};
//!
//! #[derive(Debug, Clone)]
//! struct Net {
//!     conv: Conv2d,
//!     bn: BatchNorm2d,
//!     param: Parameter,
//!     buff: Tensor,
//! }
//!
//! rusty_amp::module!(Net { conv, bn, param, buff });
//!
//! let mut net = Net {
//!     conv: Conv2d::new(4, 4, (3, 3)).unwrap(),
//!     bn: BatchNorm2d::new(4).unwrap(),
//!     param: Parameter::new(Tensor::ones(&[1, 3, 1, 1])),
//!     buff: Tensor::ones(&[1, 3, 1, 1]),
//! };
//!
//! // Convert in place: every tensor is now channel-last.
//! convert_module_format(&mut net, true).unwrap();
//! for (_, tensor) in named_tensors(&net).unwrap() {
//!     assert_eq!(tensor.format(), Format::Nhwc);
//! }
//! ```

// Declare public modules that constitute the core library API.
pub mod amp;
pub mod config;
pub mod format;
pub mod nn;
pub mod serialization;
pub mod tensor;
