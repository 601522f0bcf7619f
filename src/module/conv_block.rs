use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// Convolution, ReLU, batch norm, 2x2 max pooling and dropout.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    pool: MaxPool2d,
    dropout: Dropout,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv.forward(x));
        let x = self.norm.forward(x);
        let x = self.pool.forward(x);

        self.dropout.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    channels: [usize; 2],

    #[config(default = "[3, 3]")]
    kernel_size: [usize; 2],

    #[config(default = "[2, 2]")]
    pool_size: [usize; 2],

    #[config(default = 0.25)]
    dropout: f64,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            pool: MaxPool2dConfig::new(self.pool_size)
                .with_strides(self.pool_size)
                .init(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}
