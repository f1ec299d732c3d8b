//! # Neural Network Modules
//!
//! Building blocks for composing networks as trees of modules.
//!
//! A module owns named submodules, learnable [`Parameter`]s and plain
//! tensors. The owned fields of each module type are registered with the
//! [`module!`](crate::module) macro, which gives every type the three
//! traversals of the [`Module`] trait: read-only, in-place and mapping.
//!
//! ## Available Layers
//!
//! - [`Conv2d`]: 2D convolution with configurable stride, padding, dilation, groups
//! - [`BatchNorm2d`]: Batch normalization with running statistics
//! - [`Linear`]: Fully connected / dense layer
//!
//! ## Containers
//!
//! - `Option<M>` and `Vec<M>` of modules are modules
//! - [`Shared`]: reference-counted submodule for weight tying
//!
//! ## Example
//!
//! ```rust
//! use rusty_amp::nn::{named_tensors, BatchNorm2d, Conv2d};
//! use rusty_amp::tensor::{Parameter, Tensor};
//!
//! #[derive(Debug, Clone)]
//! struct Stem {
//!     conv: Conv2d,
//!     bn: BatchNorm2d,
//!     scale: Parameter,
//! }
//!
//! rusty_amp::module!(Stem { conv, bn, scale });
//!
//! let stem = Stem {
//!     conv: Conv2d::new(3, 8, (3, 3)).unwrap(),
//!     bn: BatchNorm2d::new(8).unwrap(),
//!     scale: Parameter::new(Tensor::ones(&[1, 8, 1, 1])),
//! };
//! let names: Vec<String> = named_tensors(&stem).unwrap().into_iter().map(|(n, _)| n).collect();
//! assert_eq!(names[0], "conv.weight");
//! assert_eq!(names.len(), 7);
//! ```

pub mod batchnorm;
pub mod conv;
pub mod init;
pub mod linear;
pub mod module;
pub mod shared;
pub mod state;

pub use batchnorm::{BatchNorm2d, BatchNormConfig};
pub use conv::{Conv2d, Conv2dConfig};
pub use linear::Linear;
pub use shared::Shared;
pub use state::{load_state_dict, state_dict, LoadOutcome, StateDict};

// Base trait and traversal
pub use module::{
    named_buffers, named_parameters, named_tensors, num_params, Module, ModuleError,
    ModuleMapper, ModulePath, ModuleResult, ModuleVisitor, ModuleVisitorMut,
};

pub use crate::tensor::{Parameter, Tensor, TensorKind};
