//! Fully connected (linear) layer.

use crate::nn::init;
use crate::nn::module::{ModuleError, ModuleResult};
use crate::tensor::Parameter;

/// Fully connected layer, `y = x W^T + b`.
///
/// `weight` is `[out_features, in_features]`, `bias` is `[out_features]`.
/// Neither is image-like, so a layout conversion only retags them.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
}

crate::module!(Linear { weight, bias });

impl Linear {
    /// Creates a linear layer with uniformly initialized weights and bias.
    pub fn new(in_features: usize, out_features: usize) -> ModuleResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(ModuleError::InvalidConfig(format!(
                "linear layer {} -> {} must have positive sizes",
                in_features, out_features
            )));
        }
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = Parameter::new(init::uniform(&[out_features, in_features], -bound, bound));
        let bias = Some(Parameter::new(init::uniform(&[out_features], -bound, bound)));

        Ok(Self { weight, bias })
    }

    /// Drops the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }
}
