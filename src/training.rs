use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::RecorderError,
    tensor::backend::AutodiffBackend,
};

use crate::{
    data::DatasetHandle,
    error::{ErrorKind, Tagged},
    model::{CheckpointRecorder, Model},
    report::{EpochMetrics, TrainingReport},
};

/// Extension the checkpoint recorder gives its files.
pub const CHECKPOINT_EXTENSION: &str = "mpk";

const CONFIG_FILE_NAME: &str = "training_config.json";

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,

    #[config(default = 10)]
    pub epoch_count: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 4)]
    pub worker_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("training needs at least one epoch")]
    NoEpochs,
    #[error("failed to prepare checkpoint directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write training configuration: {0}")]
    SaveConfig(std::io::Error),
    #[error("failed to write checkpoint: {0}")]
    Checkpoint(#[from] RecorderError),
}

impl Tagged for TrainingError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InternalFailure
    }
}

/// Loss and accuracy over a whole dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

impl Evaluation {
    /// Display line used for both trained and loaded models.
    pub fn summary(&self) -> String {
        format!(
            "Accuracy: {:.2}%, Loss: {:.2}%",
            self.accuracy * 100.,
            self.loss * 100.
        )
    }
}

pub struct TrainingOutcome<B: Backend> {
    /// The model as it stands after the last epoch.
    pub model: Model<B>,
    /// Final pass over the validation set with `model`.
    pub evaluation: Evaluation,
    pub report: TrainingReport,
    pub checkpoint: PathBuf,
}

/// Tracks the best validation accuracy of a run. Starts below any real value,
/// so the first epoch always improves.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestAccuracy {
    best: Option<f64>,
}

impl BestAccuracy {
    /// True when `accuracy` strictly beats every value seen so far.
    pub fn improves(&mut self, accuracy: f64) -> bool {
        match self.best {
            Some(best) if accuracy <= best => false,
            _ => {
                self.best = Some(accuracy);
                true
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

#[derive(Default)]
struct Meter {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl Meter {
    fn add(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    fn evaluation(&self) -> Evaluation {
        if self.seen == 0 {
            return Evaluation {
                loss: 0.,
                accuracy: 0.,
            };
        }
        Evaluation {
            loss: self.loss_sum / self.seen as f64,
            accuracy: self.correct as f64 / self.seen as f64,
        }
    }
}

/// Run `model` over `data` once, without gradients.
pub fn evaluate<B: Backend>(model: &Model<B>, data: &DatasetHandle, device: &B::Device) -> Evaluation {
    let mut meter = Meter::default();

    for batch in data.dataloader::<B>(device, 0, 1).iter() {
        let batch_size = batch.images.dims()[0];
        let (loss, correct) = model.forward_loss(batch.images, batch.targets);
        meter.add(loss.into_scalar().elem::<f64>(), correct, batch_size);
    }

    meter.evaluation()
}

/// Train a copy of `model` for `config.epoch_count` epochs.
///
/// After every epoch the copy is evaluated on `valid_set`; whenever its
/// accuracy beats the best of the run, it is written to `checkpoint` (path
/// without extension). `model` itself is never touched, so a failed run
/// leaves the caller's model as it was.
pub fn train<B: AutodiffBackend>(
    train_set: &DatasetHandle,
    valid_set: &DatasetHandle,
    model: &Model<B>,
    config: &TrainingConfig,
    checkpoint: &Path,
    device: &B::Device,
    on_epoch: &mut dyn FnMut(&EpochMetrics),
) -> Result<TrainingOutcome<B>, TrainingError> {
    if config.epoch_count == 0 {
        return Err(TrainingError::NoEpochs);
    }

    if let Some(dir) = checkpoint.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| TrainingError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        config
            .save(dir.join(CONFIG_FILE_NAME))
            .map_err(TrainingError::SaveConfig)?;
    }

    B::seed(config.seed);

    let mut model = model.clone();
    let mut optim = config.optimizer.init();
    let dataloader_train = train_set.dataloader::<B>(device, config.seed, config.worker_count);

    let mut best = BestAccuracy::default();
    let mut report = TrainingReport::default();

    for epoch in 1..=config.epoch_count {
        let mut meter = Meter::default();

        for batch in dataloader_train.iter() {
            let batch_size = batch.images.dims()[0];
            let (loss, correct) = model.forward_loss(batch.images, batch.targets);
            meter.add(loss.clone().into_scalar().elem::<f64>(), correct, batch_size);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let train_metrics = meter.evaluation();
        let valid_metrics = evaluate(&model.valid(), valid_set, device);

        let checkpointed = best.improves(valid_metrics.accuracy);
        if checkpointed {
            model.clone().save_file(checkpoint, &CheckpointRecorder::new())?;
        }

        let metrics = EpochMetrics {
            epoch,
            train_accuracy: train_metrics.accuracy,
            train_loss: train_metrics.loss,
            valid_accuracy: valid_metrics.accuracy,
            valid_loss: valid_metrics.loss,
            checkpointed,
        };
        tracing::info!(
            "Epoch {epoch}/{}: accuracy {:.4} loss {:.4} val_accuracy {:.4} val_loss {:.4}{}",
            config.epoch_count,
            metrics.train_accuracy,
            metrics.train_loss,
            metrics.valid_accuracy,
            metrics.valid_loss,
            if checkpointed { " (checkpoint saved)" } else { "" }
        );
        on_epoch(&metrics);
        report.push(metrics);
    }

    let evaluation = evaluate(&model.valid(), valid_set, device);

    Ok(TrainingOutcome {
        model,
        evaluation,
        report,
        checkpoint: checkpoint.with_extension(CHECKPOINT_EXTENSION),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{load_directory, Split},
        model::{build_model, load_model},
    };
    use burn::backend::{Autodiff, NdArray};
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray>;

    fn write_class(dir: &Path, count: usize, color: [u8; 3]) {
        fs::create_dir_all(dir).unwrap();
        for idx in 0..count {
            RgbImage::from_pixel(32, 32, Rgb(color))
                .save(dir.join(format!("{idx}.png")))
                .unwrap();
        }
    }

    fn tiny_split(root: &Path, split: Split) -> DatasetHandle {
        write_class(&root.join("cats"), 3, [20, 20, 20]);
        write_class(&root.join("dogs"), 3, [230, 230, 230]);
        load_directory(root, split).unwrap()
    }

    #[test]
    fn checkpoint_only_on_strict_improvement() {
        let mut best = BestAccuracy::default();
        let decisions: Vec<bool> = [0.0, 0.5, 0.5, 0.4, 0.75, 0.75]
            .into_iter()
            .map(|accuracy| best.improves(accuracy))
            .collect();
        assert_eq!(decisions, vec![true, true, false, false, true, false]);
        assert_eq!(best.best(), Some(0.75));
    }

    #[test]
    fn zero_epochs_is_rejected_without_writing() {
        let dir = tempdir().unwrap();
        let train_set = tiny_split(&dir.path().join("train"), Split::Training);
        let valid_set = tiny_split(&dir.path().join("valid"), Split::Validation);
        let device = Default::default();
        let model = build_model::<TestBackend>(&device);
        let config = TrainingConfig::new(AdamConfig::new()).with_epoch_count(0);
        let checkpoint = dir.path().join("artifacts").join("model_best");

        let result = train(
            &train_set,
            &valid_set,
            &model,
            &config,
            &checkpoint,
            &device,
            &mut |_: &EpochMetrics| {},
        );
        assert!(matches!(result, Err(TrainingError::NoEpochs)));
        assert!(!checkpoint.with_extension(CHECKPOINT_EXTENSION).exists());
    }

    #[test]
    fn training_reports_every_epoch() {
        let dir = tempdir().unwrap();
        let train_set = tiny_split(&dir.path().join("train"), Split::Training);
        let valid_set = tiny_split(&dir.path().join("valid"), Split::Validation);
        let device = Default::default();
        let model = build_model::<TestBackend>(&device);
        let config = TrainingConfig::new(AdamConfig::new())
            .with_epoch_count(2)
            .with_worker_count(1);
        let checkpoint = dir.path().join("artifacts").join("model_best");

        let mut seen = Vec::new();
        let outcome = train(
            &train_set,
            &valid_set,
            &model,
            &config,
            &checkpoint,
            &device,
            &mut |metrics: &EpochMetrics| seen.push(metrics.epoch),
        )
        .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(outcome.report.len(), 2);
        assert!(outcome.report.epochs()[0].checkpointed);
        assert!(outcome.checkpoint.exists());
        assert!(dir.path().join("artifacts").join(CONFIG_FILE_NAME).exists());
        assert!((0.0..=1.0).contains(&outcome.evaluation.accuracy));

        // the last epoch's validation pass and the final evaluation see the same model
        let last = outcome.report.epochs()[1];
        assert!((last.valid_accuracy - outcome.evaluation.accuracy).abs() < 1e-9);
        assert!((last.valid_loss - outcome.evaluation.loss).abs() < 1e-4);
    }

    #[test]
    fn checkpoint_reload_reproduces_evaluation() {
        let dir = tempdir().unwrap();
        let train_set = tiny_split(&dir.path().join("train"), Split::Training);
        let valid_set = tiny_split(&dir.path().join("valid"), Split::Validation);
        let device = Default::default();
        let model = build_model::<TestBackend>(&device);
        let config = TrainingConfig::new(AdamConfig::new())
            .with_epoch_count(1)
            .with_worker_count(1);
        let checkpoint = dir.path().join("model_best");

        let outcome = train(
            &train_set,
            &valid_set,
            &model,
            &config,
            &checkpoint,
            &device,
            &mut |_: &EpochMetrics| {},
        )
        .unwrap();

        let reloaded = load_model::<TestBackend>(&outcome.checkpoint, &device).unwrap();
        let again = evaluate(&reloaded.valid(), &valid_set, &device);
        assert!((again.accuracy - outcome.evaluation.accuracy).abs() < 1e-9);
        assert!((again.loss - outcome.evaluation.loss).abs() < 1e-4);
    }
}
