//! Module implementing convolutional layers for image processing.

use crate::nn::init;
use crate::nn::module::{ModuleError, ModuleResult};
use crate::tensor::{Parameter, Tensor};

/// Configuration for Conv2d layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Padding.
    pub padding: (usize, usize),
    /// Dilation (kernel expansion).
    pub dilation: (usize, usize),
    /// Number of groups for grouped/depthwise convolution.
    pub groups: usize,
    /// Use bias.
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
        }
    }
}

impl Conv2dConfig {
    /// Creates Conv2d configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            ..Default::default()
        }
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    /// Sets dilation.
    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    /// Sets number of groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Checks channel/group divisibility and non-zero sizes.
    pub fn validate(&self) -> ModuleResult<()> {
        let invalid = |msg: String| -> ModuleResult<()> { Err(ModuleError::InvalidConfig(msg)) };
        if self.in_channels == 0 || self.out_channels == 0 {
            return invalid("conv2d channels must be positive".to_string());
        }
        if self.kernel_size.0 == 0 || self.kernel_size.1 == 0 {
            return invalid(format!("conv2d kernel size {:?} must be positive", self.kernel_size));
        }
        if self.stride.0 == 0 || self.stride.1 == 0 || self.dilation.0 == 0 || self.dilation.1 == 0 {
            return invalid("conv2d stride and dilation must be positive".to_string());
        }
        if self.groups == 0
            || self.in_channels % self.groups != 0
            || self.out_channels % self.groups != 0
        {
            return invalid(format!(
                "conv2d channels ({} -> {}) must be divisible by groups ({})",
                self.in_channels, self.out_channels, self.groups
            ));
        }
        Ok(())
    }

    /// Weight shape: `[O, I, kH, kW]`, or `[G, O/G, I/G, kH, kW]` when grouped.
    pub fn weight_shape(&self) -> Vec<usize> {
        let (kh, kw) = self.kernel_size;
        if self.groups == 1 {
            vec![self.out_channels, self.in_channels, kh, kw]
        } else {
            vec![
                self.groups,
                self.out_channels / self.groups,
                self.in_channels / self.groups,
                kh,
                kw,
            ]
        }
    }

    /// Bias shape, broadcastable over `[N, C, H, W]`.
    pub fn bias_shape(&self) -> Vec<usize> {
        vec![1, self.out_channels, 1, 1]
    }

    fn fan_in(&self) -> usize {
        (self.in_channels / self.groups) * self.kernel_size.0 * self.kernel_size.1
    }
}

/// 2D Convolutional layer.
///
/// Holds the weights for a convolution over inputs of shape [N, C_in, H, W].
///
/// # Example
///
/// ```rust,ignore
/// use rusty_amp::nn::Conv2d;
///
/// let conv = Conv2d::new(3, 64, (3, 3))?.with_padding((1, 1));
/// ```
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Weight tensor, see [`Conv2dConfig::weight_shape`].
    pub weight: Parameter,
    /// Optional bias [1, C_out, 1, 1].
    pub bias: Option<Parameter>,
    /// Layer configuration.
    pub config: Conv2dConfig,
}

crate::module!(Conv2d { weight, bias });

impl Conv2d {
    /// Creates a new Conv2d layer with basic parameters.
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Kernel size (kH, kW)
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> ModuleResult<Self> {
        Self::from_config(Conv2dConfig::new(in_channels, out_channels, kernel_size))
    }

    /// Creates Conv2d layer from configuration.
    pub fn from_config(config: Conv2dConfig) -> ModuleResult<Self> {
        config.validate()?;

        let weight = Parameter::new(init::msra_uniform(&config.weight_shape(), config.fan_in()));
        let bias = if config.bias {
            Some(Parameter::new(init::zeros(&config.bias_shape())))
        } else {
            None
        };

        Ok(Self { weight, bias, config })
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.config.stride = stride;
        self
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.config.padding = padding;
        self
    }

    /// Sets dilation.
    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.config.dilation = dilation;
        self
    }

    /// Replaces the weights, which must keep their shape.
    pub fn set_weight(&mut self, weight: Tensor) -> ModuleResult<()> {
        let expected = self.config.weight_shape();
        if weight.shape() != expected {
            return Err(ModuleError::ShapeMismatch {
                name: "weight".to_string(),
                expected,
                actual: weight.shape(),
            });
        }
        self.weight = Parameter::new(weight);
        Ok(())
    }
}
