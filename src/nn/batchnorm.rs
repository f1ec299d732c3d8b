//! BatchNormalization layer for image-like inputs.
//!
//! Holds learnable gamma/beta (`weight`/`bias`) and the running statistics
//! used in eval mode. Every tensor is shaped `[1, C, 1, 1]` so that it
//! broadcasts over `[N, C, H, W]` and follows the layout of the activations.

use crate::nn::init;
use crate::nn::module::{ModuleError, ModuleResult};
use crate::tensor::{Parameter, Tensor};

/// Small constant for numerical stability.
const EPS: f32 = 1e-5;

/// Momentum for updating running statistics.
const DEFAULT_MOMENTUM: f32 = 0.1;

/// Configuration for BatchNorm2d.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    /// Learnable scale and shift.
    pub affine: bool,
    /// Keep running mean/variance buffers.
    pub track_running_stats: bool,
}

impl BatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: EPS,
            momentum: DEFAULT_MOMENTUM,
            affine: true,
            track_running_stats: true,
        }
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    pub fn with_track_running_stats(mut self, track: bool) -> Self {
        self.track_running_stats = track;
        self
    }

    fn param_shape(&self) -> [usize; 4] {
        [1, self.num_features, 1, 1]
    }
}

/// Batch Normalization layer.
///
/// y = gamma * (x - mean) / sqrt(var + eps) + beta
///
/// In training mode batch statistics are used, in inference mode the
/// accumulated running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    /// Learnable scale (gamma)
    pub weight: Option<Parameter>,
    /// Learnable shift (beta)
    pub bias: Option<Parameter>,
    pub running_mean: Option<Tensor>,
    pub running_var: Option<Tensor>,
    pub config: BatchNormConfig,
    /// Training mode flag
    pub training: bool,
}

crate::module!(BatchNorm2d {
    weight,
    bias,
    running_mean,
    running_var,
});

impl BatchNorm2d {
    /// Creates a BatchNorm2d layer over `num_features` channels.
    pub fn new(num_features: usize) -> ModuleResult<Self> {
        Self::from_config(BatchNormConfig::new(num_features))
    }

    pub fn from_config(config: BatchNormConfig) -> ModuleResult<Self> {
        if config.num_features == 0 {
            return Err(ModuleError::InvalidConfig(
                "batchnorm needs at least one feature".to_string(),
            ));
        }
        if !(config.eps > 0.0) {
            return Err(ModuleError::InvalidConfig(format!(
                "batchnorm eps must be positive, got {}",
                config.eps
            )));
        }

        let shape = config.param_shape();
        let (weight, bias) = if config.affine {
            (
                Some(Parameter::new(init::ones(&shape))),
                Some(Parameter::new(init::zeros(&shape))),
            )
        } else {
            (None, None)
        };
        let (running_mean, running_var) = if config.track_running_stats {
            (Some(init::zeros(&shape)), Some(init::ones(&shape)))
        } else {
            (None, None)
        };

        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            config,
            training: true,
        })
    }

    /// Creates a layer with the given momentum.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.config.momentum = momentum;
        self
    }

    /// Switches to training mode.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Switches to inference mode.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Resets running mean to 0 and running variance to 1, keeping their format.
    pub fn reset_running_stats(&mut self) {
        if let Some(mean) = self.running_mean.as_mut() {
            mean.fill(0.0);
        }
        if let Some(var) = self.running_var.as_mut() {
            var.fill(1.0);
        }
    }

    /// Resets gamma to 1 and beta to 0, plus the running statistics.
    pub fn reset_parameters(&mut self) {
        self.reset_running_stats();
        if let Some(weight) = self.weight.as_mut() {
            weight.fill(1.0);
        }
        if let Some(bias) = self.bias.as_mut() {
            bias.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::nn::{named_buffers, named_parameters};

    #[test]
    fn test_batchnorm_creation() {
        let bn = BatchNorm2d::new(4).unwrap();

        assert!(bn.training);
        assert_eq!(named_parameters(&bn).unwrap().len(), 2);
        assert_eq!(named_buffers(&bn).unwrap().len(), 2);
        assert_eq!(bn.weight.as_ref().unwrap().shape(), vec![1, 4, 1, 1]);
    }

    #[test]
    fn test_batchnorm_train_eval() {
        let mut bn = BatchNorm2d::new(4).unwrap();

        bn.eval();
        assert!(!bn.training);

        bn.train();
        assert!(bn.training);
    }

    #[test]
    fn test_batchnorm_without_affine_or_stats() {
        let config = BatchNormConfig::new(8)
            .with_affine(false)
            .with_track_running_stats(false);
        let bn = BatchNorm2d::from_config(config).unwrap();
        assert!(crate::nn::named_tensors(&bn).unwrap().is_empty());
    }

    #[test]
    fn test_batchnorm_invalid_config() {
        assert!(BatchNorm2d::new(0).is_err());
        let config = BatchNormConfig::new(2).with_eps(0.0);
        assert!(matches!(
            BatchNorm2d::from_config(config),
            Err(ModuleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reset_running_stats_keeps_format() {
        let mut bn = BatchNorm2d::new(3).unwrap().with_momentum(0.9);
        let mean = bn.running_mean.as_mut().unwrap();
        mean.set_format(Format::Nhwc);
        mean.fill(5.0);

        bn.reset_running_stats();

        let mean = bn.running_mean.as_ref().unwrap();
        assert_eq!(mean.format(), Format::Nhwc);
        assert!(mean.to_array().iter().all(|&x| x == 0.0));
        assert_eq!(bn.config.momentum, 0.9);
    }
}
