//! Module for saving and loading module state.
//!
//! State is stored as **SafeTensors**, a safe binary format for tensors.
//! Layout tags travel in the file metadata, so a converted model loads back
//! in the format it was saved in.
//!
//! # Examples
//!
//! ```rust,ignore
//! use rusty_amp::serialization::{save_module, load_module};
//!
//! save_module("model.safetensors", &model)?;
//! let outcome = load_module("model.safetensors", &mut model, true)?;
//! ```

pub mod safetensors_io;

pub use safetensors_io::{
    list_tensors, load_module, load_state_dict_file, load_tensor, save_module, save_state_dict,
    tensor_info, SafeTensorsError, TensorInfo,
};
