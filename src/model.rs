use std::path::Path;

use burn::{
    nn::{
        loss::BinaryCrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::activation::{relu, sigmoid},
};

use crate::{
    error::{ErrorKind, Tagged},
    module::conv_block::{ConvBlock, ConvBlockConfig},
    preprocess::{CHANNEL_COUNT, IMAGE_SIZE},
};

/// Recorder used for checkpoints and for loading saved models.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model file {0} does not exist")]
    Missing(String),
    #[error("failed to read model: {0}")]
    Record(#[from] RecorderError),
}

impl Tagged for ModelError {
    fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Missing(_) | ModelError::Record(RecorderError::FileNotFound(_)) => {
                ErrorKind::NotFound
            }
            ModelError::Record(_) => ErrorKind::InternalFailure,
        }
    }
}

#[derive(Module, Debug)]
struct Head<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    bottleneck: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> Head<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        let x = relu(self.bottleneck.forward(x));
        self.output.forward(x)
    }
}

/// Binary cat/dog network producing one logit per image.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    head: Head<B>,
}

impl<B: Backend> Model<B> {
    /// `[batch, 3, 128, 128]` images to `[batch, 1]` logits.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        let x = x.flatten(1, 3);
        self.head.forward(x)
    }

    /// Sigmoid of the logit: probability of the second class.
    pub fn forward_probability(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(x))
    }

    /// Returns `(loss, correct_predictions)` for one batch.
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
    ) -> (Tensor<B, 1>, usize) {
        let logits = self.forward(images);

        let correct = logits
            .clone()
            .greater_elem(0.0)
            .int()
            .equal(targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>() as usize;

        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits, targets);

        (loss, correct)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "[32, 64, 128]")]
    pub channels: [usize; 3],

    #[config(default = 0.25)]
    pub block_dropout: f64,

    #[config(default = 128)]
    pub hidden: usize,

    #[config(default = 64)]
    pub bottleneck: usize,

    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let mut input_channel = CHANNEL_COUNT;
        let mut size = IMAGE_SIZE;

        let mut blocks = vec![];
        for channel in self.channels {
            blocks.push(
                ConvBlockConfig::new([input_channel, channel])
                    .with_dropout(self.block_dropout)
                    .init(device),
            );
            input_channel = channel;
            size /= 2;
        }

        let head = Head {
            hidden: LinearConfig::new(input_channel * size * size, self.hidden).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            bottleneck: LinearConfig::new(self.hidden, self.bottleneck).init(device),
            output: LinearConfig::new(self.bottleneck, 1).init(device),
        };

        Model { blocks, head }
    }
}

/// Fresh, untrained network with the fixed architecture.
pub fn build_model<B: Backend>(device: &B::Device) -> Model<B> {
    ModelConfig::new().init(device)
}

/// Load a model saved by the checkpoint recorder.
pub fn load_model<B: Backend>(path: &Path, device: &B::Device) -> Result<Model<B>, ModelError> {
    if !path.is_file() {
        return Err(ModelError::Missing(path.display().to_string()));
    }

    let model = build_model::<B>(device).load_file(path, &CheckpointRecorder::new(), device)?;
    tracing::info!("Loaded model from {}", path.display());
    Ok(model)
}
