//! Module for working with the SafeTensors format.
//!
//! SafeTensors is a safe and efficient tensor storage format developed by
//! HuggingFace. Values are written in logical order as little-endian `f32`;
//! the layout tag of each tensor goes into the file metadata under
//! `format.<name>` and is restored (re-laying the storage) on load.

use crate::format::{Format, FormatError};
use crate::nn::{load_state_dict, state_dict, LoadOutcome, Module, ModuleError, StateDict};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use safetensors::serialize_to_file;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Metadata key prefix for layout tags.
const FORMAT_KEY_PREFIX: &str = "format.";

/// Errors when working with SafeTensors
#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor shape error: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),

    #[error("Invalid format metadata: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Description of one tensor stored in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    /// Logical shape.
    pub shape: Vec<usize>,
    pub dtype: String,
    pub format: Format,
}

/// Saves a state dict to a SafeTensors file.
///
/// # Arguments
///
/// * `path` - Path to the file to write
/// * `dict` - Tensors to save with their names
///
/// # Example
///
/// ```rust,ignore
/// use rusty_amp::nn::state_dict;
/// use rusty_amp::serialization::save_state_dict;
///
/// save_state_dict("weights.safetensors", &state_dict(&model)?)?;
/// ```
pub fn save_state_dict<P: AsRef<Path>>(path: P, dict: &StateDict) -> Result<()> {
    // First convert all data to bytes so the views can borrow it
    let mut data_storage: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(dict.len());
    let mut metadata: HashMap<String, String> = HashMap::new();

    for (name, tensor) in dict.iter() {
        let data: Vec<u8> = tensor
            .logical_view()
            .iter()
            .flat_map(|&x| x.to_le_bytes())
            .collect();
        data_storage.push((name.to_string(), tensor.shape(), data));
        metadata.insert(format!("{FORMAT_KEY_PREFIX}{name}"), tensor.format().to_string());
    }

    let mut tensor_views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(data_storage.len());
    for (name, shape, data) in &data_storage {
        tensor_views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?));
    }

    serialize_to_file(tensor_views, &Some(metadata), path.as_ref())?;
    debug!(path = %path.as_ref().display(), tensors = dict.len(), "saved state dict");

    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    Ok(fs::read(path)?)
}

fn stored_formats(buffer: &[u8]) -> Result<HashMap<String, Format>> {
    let (_, metadata) = SafeTensors::read_metadata(buffer)?;
    let mut formats = HashMap::new();
    if let Some(entries) = metadata.metadata() {
        for (key, value) in entries {
            if let Some(name) = key.strip_prefix(FORMAT_KEY_PREFIX) {
                formats.insert(name.to_string(), value.parse()?);
            }
        }
    }
    Ok(formats)
}

fn decode_values(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()),
        Dtype::F64 => Ok(data
            .chunks_exact(8)
            .map(|chunk| {
                let val = f64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ]);
                val as f32
            })
            .collect()),
        other => Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
    }
}

/// Loads a state dict from a SafeTensors file, sorted by name.
///
/// Tensors without format metadata (files written by other tools) get the
/// `default` format.
pub fn load_state_dict_file<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let buffer = read_file(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let formats = stored_formats(&buffer)?;

    let mut entries = tensors.tensors();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut dict = StateDict::new();
    for (name, view) in entries {
        let shape = view.shape().to_vec();
        let floats = decode_values(&view)?;
        let floats_len = floats.len();

        let arr = ArrayD::from_shape_vec(IxDyn(&shape), floats).map_err(|_| {
            SafeTensorsError::ShapeMismatch {
                expected: shape.clone(),
                actual: vec![floats_len],
            }
        })?;
        let format = formats.get(&name).copied().unwrap_or_default();
        dict.insert(name, Tensor::from_array(arr).with_format(format));
    }

    debug!(path = %path.as_ref().display(), tensors = dict.len(), "loaded state dict");
    Ok(dict)
}

/// Loads a specific tensor by name from a SafeTensors file.
pub fn load_tensor<P: AsRef<Path>>(path: P, name: &str) -> Result<Tensor> {
    let dict = load_state_dict_file(path)?;
    dict.get(name)
        .cloned()
        .ok_or_else(|| SafeTensorsError::TensorNotFound(name.to_string()))
}

/// Writes every tensor of `module` to a SafeTensors file.
pub fn save_module<M: Module, P: AsRef<Path>>(path: P, module: &M) -> Result<()> {
    save_state_dict(path, &state_dict(module)?)
}

/// Loads the values of a SafeTensors file into `module`.
pub fn load_module<M: Module, P: AsRef<Path>>(
    path: P,
    module: &mut M,
    strict: bool,
) -> Result<LoadOutcome> {
    let dict = load_state_dict_file(path)?;
    Ok(load_state_dict(module, &dict, strict)?)
}

/// Returns the list of tensor names in a SafeTensors file.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = read_file(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}

/// Returns information about the tensors in a file (name, shape, type, format).
pub fn tensor_info<P: AsRef<Path>>(path: P) -> Result<Vec<TensorInfo>> {
    let buffer = read_file(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let formats = stored_formats(&buffer)?;

    let mut info: Vec<TensorInfo> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorInfo {
            format: formats.get(&name).copied().unwrap_or_default(),
            shape: view.shape().to_vec(),
            dtype: format!("{:?}", view.dtype()),
            name,
        })
        .collect();
    info.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::BatchNorm2d;
    use approx::assert_abs_diff_eq;

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::from_vec(shape, (0..n).map(|x| x as f32 * 0.5).collect()).unwrap()
    }

    #[test]
    fn test_save_load_keeps_values_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut dict = StateDict::new();
        dict.insert("conv.weight", arange(&[2, 3, 2, 2]).with_format(Format::Nhwc));
        dict.insert("conv.bias", arange(&[3]));
        save_state_dict(&path, &dict).unwrap();

        let loaded = load_state_dict_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);

        let weight = loaded.get("conv.weight").unwrap();
        assert_eq!(weight.format(), Format::Nhwc);
        assert_eq!(weight.shape(), vec![2, 3, 2, 2]);
        let original = dict.get("conv.weight").unwrap().to_array();
        for (a, b) in original.iter().zip(weight.to_array().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
        assert_eq!(loaded.get("conv.bias").unwrap().format(), Format::Default);
    }

    #[test]
    fn test_list_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.safetensors");

        let mut dict = StateDict::new();
        dict.insert("layer2.weight", Tensor::zeros(&[4, 4]));
        dict.insert("layer1.weight", Tensor::zeros(&[1, 4, 1, 1]).with_format(Format::Nhwc));
        save_state_dict(&path, &dict).unwrap();

        let names = list_tensors(&path).unwrap();
        assert_eq!(names, vec!["layer1.weight", "layer2.weight"]);

        let info = tensor_info(&path).unwrap();
        assert_eq!(info[0].format, Format::Nhwc);
        assert_eq!(info[0].shape, vec![1, 4, 1, 1]);
        assert_eq!(info[0].dtype, "F32");
        assert_eq!(info[1].format, Format::Default);
    }

    #[test]
    fn test_load_tensor_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.safetensors");
        let mut dict = StateDict::new();
        dict.insert("only", Tensor::ones(&[2]));
        save_state_dict(&path, &dict).unwrap();

        assert_eq!(load_tensor(&path, "only").unwrap(), Tensor::ones(&[2]));
        assert!(matches!(
            load_tensor(&path, "other"),
            Err(SafeTensorsError::TensorNotFound(_))
        ));
    }

    #[test]
    fn test_module_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bn.safetensors");

        let mut source = BatchNorm2d::new(3).unwrap();
        source.running_var.as_mut().unwrap().fill(2.5);
        save_module(&path, &source).unwrap();

        let mut target = BatchNorm2d::new(3).unwrap();
        let outcome = load_module(&path, &mut target, true).unwrap();
        assert!(outcome.missing.is_empty());
        assert!(target.running_var.as_ref().unwrap().to_array().iter().all(|&x| x == 2.5));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_state_dict_file(dir.path().join("absent.safetensors")).unwrap_err();
        assert!(matches!(err, SafeTensorsError::IoError(_)));
    }
}
