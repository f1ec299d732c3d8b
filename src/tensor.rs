//! Module defining `Tensor`, `Parameter` and `TensorKind`.
//!
//! A `Tensor` is a dense `f32` array with a layout tag ([`Format`]). The tag
//! decides how the raw storage is ordered; the logical shape and logical
//! values are the same whatever the format is. Switching a rank-4 tensor to
//! `nhwc` keeps its shape `[N, C, H, W]` but stores the data channel-last.
//!
//! Storage is shared copy-on-write: cloning a `Tensor` is cheap and a later
//! mutation of either copy never shows through the other.

use crate::format::Format;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// What happened to a tensor when its format was changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Relayout {
    /// The tensor was already in the requested format.
    Unchanged,
    /// Only the tag changed; storage order was already right.
    Retagged,
    /// The raw storage was permuted.
    Permuted,
}

/// Dense tensor with a layout tag.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Raw values in storage order, always in standard (row-major) layout.
    storage: Rc<ArrayD<f32>>,
    format: Format,
}

impl Tensor {
    /// Wraps logical data with the `default` format.
    pub fn from_array(data: ArrayD<f32>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self {
            storage: Rc::new(data),
            format: Format::Default,
        }
    }

    /// Builds a tensor from a flat vector in logical row-major order.
    pub fn from_vec(shape: &[usize], values: Vec<f32>) -> Result<Self, TensorError> {
        let actual = vec![values.len()];
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                actual,
            }
        })?;
        Ok(Self::from_array(data))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Returns the same tensor re-laid out in `format`.
    pub fn with_format(mut self, format: Format) -> Self {
        self.set_format(format);
        self
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Logical shape, independent of the storage order.
    pub fn shape(&self) -> Vec<usize> {
        self.logical_view().shape().to_vec()
    }

    /// Shape of the raw storage.
    pub fn storage_shape(&self) -> Vec<usize> {
        self.storage.shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.storage.ndim()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// View of the data in logical axis order.
    pub fn logical_view(&self) -> ArrayViewD<'_, f32> {
        let view = self.storage.view();
        match self.format.logical_permutation(self.ndim()) {
            Some(perm) => view.permuted_axes(perm),
            None => view,
        }
    }

    /// Owned copy of the data in logical axis order.
    pub fn to_array(&self) -> ArrayD<f32> {
        self.logical_view().as_standard_layout().into_owned()
    }

    /// View of the raw storage, axes in storage order.
    pub fn storage(&self) -> ArrayViewD<'_, f32> {
        self.storage.view()
    }

    /// Raw values in the order they are stored.
    pub fn raw_values(&self) -> Vec<f32> {
        self.storage.iter().copied().collect()
    }

    /// True when both tensors share the same storage allocation.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    /// Changes the layout tag, permuting the raw storage when the storage
    /// order of the old and new format differ.
    pub fn set_format(&mut self, format: Format) -> Relayout {
        if self.format == format {
            return Relayout::Unchanged;
        }
        let ndim = self.ndim();
        if self.format.storage_permutation(ndim) == format.storage_permutation(ndim) {
            self.format = format;
            return Relayout::Retagged;
        }

        let relaid = {
            let logical = self.logical_view();
            match format.storage_permutation(ndim) {
                Some(perm) => logical.permuted_axes(perm).as_standard_layout().into_owned(),
                None => logical.as_standard_layout().into_owned(),
            }
        };
        self.storage = Rc::new(relaid);
        self.format = format;
        Relayout::Permuted
    }

    /// Replaces the values with new logical data, keeping the current format.
    pub fn set_data(&mut self, data: ArrayD<f32>) -> Result<(), TensorError> {
        let expected = self.shape();
        if data.shape() != expected.as_slice() {
            return Err(TensorError::ShapeMismatch {
                expected,
                actual: data.shape().to_vec(),
            });
        }
        let format = self.format;
        *self = Tensor::from_array(data).with_format(format);
        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        Rc::make_mut(&mut self.storage).fill(value);
    }
}

/// Two tensors are equal when they hold the same logical values with the same tag.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format && self.logical_view() == other.logical_view()
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(data: ArrayD<f32>) -> Self {
        Tensor::from_array(data)
    }
}

/// Kind of a tensor attribute owned by a module.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TensorKind {
    /// Learnable tensor.
    Parameter,
    /// Plain tensor attribute (running statistics, constants, ...).
    Buffer,
}

/// A learnable tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    tensor: Tensor,
    /// Whether gradients should be tracked for this parameter.
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            tensor,
            requires_grad: true,
        }
    }

    /// Marks the parameter as frozen.
    pub fn no_grad(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }
}

impl From<Tensor> for Parameter {
    fn from(tensor: Tensor) -> Self {
        Parameter::new(tensor)
    }
}

impl Deref for Parameter {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl DerefMut for Parameter {
    fn deref_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }
}
