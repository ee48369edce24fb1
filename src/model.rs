use core::str::FromStr;

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::{leaky_relu, relu},
};

use crate::error::ModelError;

/// Number of channels of the RGB input images.
pub const INPUT_CHANNELS: usize = 3;

/// Negative slope of [Activation::LeakyRelu], matching PyTorch's default.
pub const LEAKY_RELU_SLOPE: f64 = 0.01;

/// Non-linearity applied after a convolution or a fully-connected layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// `max(0, x)`
    Relu,
    /// `max(0, x) + 0.01 * min(0, x)`
    LeakyRelu,
}

impl FromStr for Activation {
    type Err = ModelError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "leakyrelu" => Ok(Self::LeakyRelu),
            _ => Err(ModelError::UnknownActivation(name.to_string())),
        }
    }
}

impl Activation {
    /// Applies the activation element-wise.
    ///
    /// # Shapes
    /// - input: `[..., any]`
    /// - output: `[..., any]`
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Relu => relu(input),
            Self::LeakyRelu => leaky_relu(input, LEAKY_RELU_SLOPE),
        }
    }
}

/// Configuration of one convolutional stage.
#[derive(Config, Debug)]
pub struct ConvLayerConfig {
    /// Number of output channels.
    pub filters: usize,
    /// Size of the square kernel.
    pub kernel_size: usize,
    /// Activation name, `relu` or `leakyrelu`.
    pub activation: String,
}

/// Configuration of one fully-connected stage.
#[derive(Config, Debug)]
pub struct DenseLayerConfig {
    /// Number of output features.
    pub units: usize,
    /// Activation name, `relu` or `leakyrelu`.
    pub activation: String,
}

/// Architecture found by the search, as a declarative list of stages.
#[derive(Config, Debug)]
pub struct NasModelConfig {
    /// Convolutional stages, applied in order.
    pub conv_layers: Vec<ConvLayerConfig>,
    /// Fully-connected stages, applied in order after global pooling.
    pub fc_layers: Vec<DenseLayerConfig>,
    /// Dropout probability shared by every fully-connected stage.
    #[config(default = 0.3)]
    pub dropout: f64,
    /// Width of the output layer.
    #[config(default = 4)]
    pub num_classes: usize,
}

impl NasModelConfig {
    /// The architecture the tumor classifier weights were trained with.
    pub fn tumor_classifier() -> Self {
        let conv = |filters, kernel_size, activation: &str| {
            ConvLayerConfig::new(filters, kernel_size, activation.to_string())
        };
        let dense = |units, activation: &str| DenseLayerConfig::new(units, activation.to_string());

        Self::new(
            vec![
                conv(128, 2, "relu"),
                conv(32, 2, "relu"),
                conv(32, 2, "relu"),
                conv(16, 2, "leakyrelu"),
                conv(32, 2, "leakyrelu"),
                conv(128, 5, "leakyrelu"),
            ],
            vec![dense(128, "leakyrelu"), dense(128, "relu")],
        )
    }

    /// Builds the network with freshly initialized parameters.
    ///
    /// Every activation name is resolved and every size validated before any parameter is
    /// allocated, so a bad description never yields a partially built graph.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<NasModel<B>, ModelError> {
        if self.conv_layers.is_empty() {
            return Err(ModelError::EmptyConvStack);
        }
        if self.num_classes == 0 {
            return Err(invalid_layer("output", "the class count must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(invalid_layer(
                "dropout",
                &format!("probability {} is outside [0, 1)", self.dropout),
            ));
        }

        let conv_activations = self
            .conv_layers
            .iter()
            .enumerate()
            .map(|(index, layer)| layer.validate(index))
            .collect::<Result<Vec<_>, _>>()?;
        let dense_activations = self
            .fc_layers
            .iter()
            .enumerate()
            .map(|(index, layer)| layer.validate(index))
            .collect::<Result<Vec<_>, _>>()?;

        let mut channels = INPUT_CHANNELS;
        let mut conv_blocks = Vec::with_capacity(self.conv_layers.len());
        for (layer, activation) in self.conv_layers.iter().zip(conv_activations) {
            conv_blocks.push(layer.init(channels, activation, device));
            channels = layer.filters;
        }

        let mut features = channels;
        let mut dense_blocks = Vec::with_capacity(self.fc_layers.len());
        for (layer, activation) in self.fc_layers.iter().zip(dense_activations) {
            dense_blocks.push(layer.init(features, activation, self.dropout, device));
            features = layer.units;
        }

        Ok(NasModel {
            conv_blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense_blocks,
            output: LinearConfig::new(features, self.num_classes).init(device),
        })
    }
}

impl ConvLayerConfig {
    fn validate(&self, index: usize) -> Result<Activation, ModelError> {
        let layer = format!("conv_layers[{index}]");
        if self.filters == 0 {
            return Err(invalid_layer(&layer, "the filter count must be positive"));
        }
        if self.kernel_size == 0 {
            return Err(invalid_layer(&layer, "the kernel size must be positive"));
        }

        self.activation.parse()
    }

    fn init<B: Backend>(
        &self,
        in_channels: usize,
        activation: Activation,
        device: &B::Device,
    ) -> ConvBlock<B> {
        let padding = self.kernel_size / 2;

        ConvBlock {
            conv: Conv2dConfig::new(
                [in_channels, self.filters],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device),
            norm: BatchNormConfig::new(self.filters).init(device),
            activation: Ignored(activation),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

impl DenseLayerConfig {
    fn validate(&self, index: usize) -> Result<Activation, ModelError> {
        if self.units == 0 {
            return Err(invalid_layer(
                &format!("fc_layers[{index}]"),
                "the unit count must be positive",
            ));
        }

        self.activation.parse()
    }

    fn init<B: Backend>(
        &self,
        in_features: usize,
        activation: Activation,
        dropout: f64,
        device: &B::Device,
    ) -> DenseBlock<B> {
        DenseBlock {
            linear: LinearConfig::new(in_features, self.units).init(device),
            activation: Ignored(activation),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }
}

fn invalid_layer(layer: &str, reason: &str) -> ModelError {
    ModelError::InvalidLayer {
        layer: layer.to_string(),
        reason: reason.to_string(),
    }
}

/// Convolution, batch normalization, activation and 2x downsampling.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
    pub activation: Ignored<Activation>,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    /// # Shapes
    /// - input: `[batch_size, in_channels, height, width]`
    /// - output: `[batch_size, filters, (height + 2p - k + 1) / 2, (width + 2p - k + 1) / 2]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);

        self.pool.forward(x)
    }
}

/// Linear layer, activation and dropout.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub linear: Linear<B>,
    pub activation: Ignored<Activation>,
    pub dropout: Dropout,
}

impl<B: Backend> DenseBlock<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(input);
        let x = self.activation.forward(x);

        self.dropout.forward(x)
    }
}

/// Feed-forward classifier assembled from a [NasModelConfig].
///
/// Global average pooling sits between the convolutional and the fully-connected stages,
/// so the output width doesn't depend on the input resolution.
#[derive(Module, Debug)]
pub struct NasModel<B: Backend> {
    pub conv_blocks: Vec<ConvBlock<B>>,
    pub pool: AdaptiveAvgPool2d,
    pub dense_blocks: Vec<DenseBlock<B>>,
    pub output: Linear<B>,
}

impl<B: Backend> NasModel<B> {
    /// Computes the class logits.
    ///
    /// # Shapes
    /// - input: `[batch_size, 3, height, width]`
    /// - output: `[batch_size, num_classes]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .conv_blocks
            .iter()
            .fold(input, |x, block| block.forward(x));

        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self
            .dense_blocks
            .iter()
            .fold(x, |x, block| block.forward(x));

        self.output.forward(x)
    }

    /// Width of the output layer.
    pub fn num_classes(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}
