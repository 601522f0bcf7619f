use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::mpsc::Sender,
};

use burn::{module::AutodiffModule, optim::AdamConfig, tensor::backend::AutodiffBackend};

use crate::{
    classify::{self, Prediction},
    config::AppConfig,
    data::{self, DatasetHandle, Split},
    error::{AppError, Prerequisite},
    model::{self, Model},
    preprocess::TestSample,
    report::{self, EpochMetrics, TrainingReport},
    training::{self, Evaluation, TrainingConfig},
};

pub const TRAINING_FAILURE: &str =
    "An error occurred! Make sure to load training and validation datasets and create or load a model.";
pub const CLASSIFY_WITHOUT_MODEL: &str =
    "An error occurred! Make sure to create or load a model first";

/// Result of a file or directory picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Picked(PathBuf),
    Cancelled,
}

impl From<Option<PathBuf>> for Selection {
    fn from(path: Option<PathBuf>) -> Self {
        path.map_or(Selection::Cancelled, Selection::Picked)
    }
}

impl Selection {
    fn into_path(self) -> Result<PathBuf, AppError> {
        match self {
            Selection::Picked(path) => Ok(path),
            Selection::Cancelled => Err(AppError::Cancelled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateModel,
    LoadModel(Selection),
    LoadTrainingData(Selection),
    LoadValidationData(Selection),
    LoadTestImage(Selection),
    Train { epochs: usize },
    Classify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    CreateModel,
    LoadModel,
    LoadTrainingData,
    LoadValidationData,
    LoadTestImage,
    Train,
    Classify,
}

impl Command {
    fn kind(&self) -> CommandKind {
        match self {
            Command::CreateModel => CommandKind::CreateModel,
            Command::LoadModel(_) => CommandKind::LoadModel,
            Command::LoadTrainingData(_) => CommandKind::LoadTrainingData,
            Command::LoadValidationData(_) => CommandKind::LoadValidationData,
            Command::LoadTestImage(_) => CommandKind::LoadTestImage,
            Command::Train { .. } => CommandKind::Train,
            Command::Classify => CommandKind::Classify,
        }
    }

    /// Commands worth running off the UI thread.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Command::LoadModel(_)
                | Command::LoadTrainingData(_)
                | Command::LoadValidationData(_)
                | Command::Train { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

/// One line of the output log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}

/// Results currently on display.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    /// Validation metrics of a model loaded from disk.
    pub loaded_model: Option<Evaluation>,
    /// Final validation metrics of the last training run.
    pub trained: Option<Evaluation>,
    pub prediction: Option<Prediction>,
    pub report: Option<TrainingReport>,
    pub plot: Option<PathBuf>,
}

pub struct Session<B: AutodiffBackend> {
    config: AppConfig,
    device: B::Device,
    model: Option<Model<B>>,
    training_data: Option<DatasetHandle>,
    validation_data: Option<DatasetHandle>,
    test_sample: Option<TestSample>,
    view: SessionView,
    progress: Option<Sender<EpochMetrics>>,
}

impl<B: AutodiffBackend> Session<B> {
    pub fn new(config: AppConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
            training_data: None,
            validation_data: None,
            test_sample: None,
            view: SessionView::default(),
            progress: None,
        }
    }

    /// Forward per-epoch metrics of training runs to `sink`.
    pub fn set_progress_sink(&mut self, sink: Sender<EpochMetrics>) {
        self.progress = Some(sink);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn model(&self) -> Option<&Model<B>> {
        self.model.as_ref()
    }

    pub fn training_data(&self) -> Option<&DatasetHandle> {
        self.training_data.as_ref()
    }

    pub fn validation_data(&self) -> Option<&DatasetHandle> {
        self.validation_data.as_ref()
    }

    pub fn test_sample(&self) -> Option<&TestSample> {
        self.test_sample.as_ref()
    }

    /// Check that every entity `command` depends on is present, without
    /// touching any state.
    pub fn preflight(&self, command: &Command) -> Result<(), AppError> {
        let required: &[Prerequisite] = match command {
            Command::LoadModel(_) => &[Prerequisite::ValidationData],
            Command::Train { .. } => &[
                Prerequisite::Model,
                Prerequisite::TrainingData,
                Prerequisite::ValidationData,
            ],
            Command::Classify => &[Prerequisite::Model, Prerequisite::TestImage],
            _ => &[],
        };

        let missing: Vec<Prerequisite> = required
            .iter()
            .copied()
            .filter(|prerequisite| !self.has(*prerequisite))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingPrerequisite(missing))
        }
    }

    fn has(&self, prerequisite: Prerequisite) -> bool {
        match prerequisite {
            Prerequisite::Model => self.model.is_some(),
            Prerequisite::TrainingData => self.training_data.is_some(),
            Prerequisite::ValidationData => self.validation_data.is_some(),
            Prerequisite::TestImage => self.test_sample.is_some(),
        }
    }

    /// Run `command` to completion and describe the outcome.
    pub fn dispatch(&mut self, command: Command) -> LogEntry {
        let kind = command.kind();
        tracing::debug!("Dispatching {command:?}");

        // a panicking backend must not take the event loop down with it
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.preflight(&command).and_then(|()| self.execute(command))
        }))
        .unwrap_or_else(|_| Err(AppError::Internal(format!("{kind:?} panicked"))));

        match result {
            Ok(entry) => {
                tracing::info!("{}", entry.message);
                entry
            }
            Err(err) => {
                let entry = failure_entry(kind, &err);
                match entry.level {
                    LogLevel::Info => tracing::info!("{kind:?}: {err}"),
                    LogLevel::Error => tracing::warn!("{kind:?} failed: {err}"),
                }
                entry
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<LogEntry, AppError> {
        match command {
            Command::CreateModel => {
                self.model = Some(model::build_model(&self.device));
                self.view.loaded_model = None;
                Ok(LogEntry::info("New classification model created."))
            }
            Command::LoadModel(selection) => self.load_model(selection.into_path()?),
            Command::LoadTrainingData(selection) => {
                let path = selection.into_path()?;
                self.training_data = Some(load_dataset(path, Split::Training)?);
                Ok(LogEntry::info("Training images loaded successfully."))
            }
            Command::LoadValidationData(selection) => {
                let path = selection.into_path()?;
                self.validation_data = Some(load_dataset(path, Split::Validation)?);
                Ok(LogEntry::info("Validation set loaded successfully."))
            }
            Command::LoadTestImage(selection) => {
                let path = selection.into_path()?;
                let sample = TestSample::load(&path)
                    .map_err(|err| AppError::from_component(Some(path), err))?;
                self.test_sample = Some(sample);
                self.view.prediction = None;
                Ok(LogEntry::info("Test image loading complete."))
            }
            Command::Train { epochs } => self.train(epochs),
            Command::Classify => self.classify(),
        }
    }

    fn load_model(&mut self, path: PathBuf) -> Result<LogEntry, AppError> {
        let valid_set = self
            .validation_data
            .as_ref()
            .ok_or(AppError::MissingPrerequisite(vec![Prerequisite::ValidationData]))?;

        let model = model::load_model::<B>(&path, &self.device)
            .map_err(|err| AppError::from_component(Some(path), err))?;
        let evaluation = training::evaluate(&model.valid(), valid_set, &self.device);

        self.model = Some(model);
        self.view.loaded_model = Some(evaluation);
        Ok(LogEntry::info("Classification model loaded successfully."))
    }

    fn train(&mut self, epochs: usize) -> Result<LogEntry, AppError> {
        let (Some(model), Some(train_set), Some(valid_set)) = (
            self.model.as_ref(),
            self.training_data.as_ref(),
            self.validation_data.as_ref(),
        ) else {
            return Err(AppError::MissingPrerequisite(vec![
                Prerequisite::Model,
                Prerequisite::TrainingData,
                Prerequisite::ValidationData,
            ]));
        };

        let config = TrainingConfig::new(AdamConfig::new())
            .with_epoch_count(epochs)
            .with_seed(self.config.seed)
            .with_learning_rate(self.config.learning_rate)
            .with_worker_count(self.config.train_workers);

        let progress = self.progress.as_ref();
        let outcome = training::train(
            train_set,
            valid_set,
            model,
            &config,
            &self.config.checkpoint_stem(),
            &self.device,
            &mut |metrics: &EpochMetrics| {
                if let Some(sink) = progress {
                    let _ = sink.send(*metrics);
                }
            },
        )
        .map_err(|err| AppError::from_component(None, err))?;

        let plot_path = self.config.plot_path();
        self.view.plot = match report::save_plot(&outcome.report, &plot_path) {
            Ok(()) => Some(plot_path),
            Err(err) => {
                tracing::warn!("Training history plot not written: {err}");
                None
            }
        };

        let evaluation = outcome.evaluation;
        self.model = Some(outcome.model);
        self.view.trained = Some(evaluation);
        self.view.loaded_model = None;
        self.view.report = Some(outcome.report);

        Ok(LogEntry::info(format!(
            "Training complete with loss: {:.2} and accuracy: {:.2}",
            evaluation.loss * 100.,
            evaluation.accuracy * 100.
        )))
    }

    fn classify(&mut self) -> Result<LogEntry, AppError> {
        let model = self
            .model
            .as_ref()
            .ok_or(AppError::MissingPrerequisite(vec![Prerequisite::Model]))?;
        let sample = self
            .test_sample
            .as_ref()
            .ok_or(AppError::MissingPrerequisite(vec![Prerequisite::TestImage]))?;

        let prediction = classify::classify(Some(sample), &model.valid(), &self.device);
        self.view.prediction = Some(prediction);

        match prediction.label() {
            Some(label) => Ok(LogEntry::info(format!("Image classified as: {label}"))),
            None => Err(AppError::MissingPrerequisite(vec![Prerequisite::TestImage])),
        }
    }
}

fn load_dataset(path: PathBuf, split: Split) -> Result<DatasetHandle, AppError> {
    data::load_directory(&path, split).map_err(|err| AppError::from_component(Some(path), err))
}

/// User-facing line for a failed command. Only the tag of the error matters;
/// the details go to the log.
fn failure_entry(kind: CommandKind, err: &AppError) -> LogEntry {
    if let AppError::Cancelled = err {
        return LogEntry::info(match kind {
            CommandKind::LoadTrainingData | CommandKind::LoadValidationData => {
                "No directory selected."
            }
            _ => "No file selected.",
        });
    }

    let message = match kind {
        CommandKind::CreateModel => "Model could not be created.",
        CommandKind::LoadModel if err.is_missing(Prerequisite::ValidationData) => {
            "Please load a validation set first"
        }
        CommandKind::LoadModel => "Model file could not be loaded.",
        CommandKind::LoadTrainingData => "Training images not found.",
        CommandKind::LoadValidationData => "Validation set not found.",
        CommandKind::LoadTestImage => "Test image not found.",
        CommandKind::Train => TRAINING_FAILURE,
        CommandKind::Classify if err.is_missing(Prerequisite::Model) => CLASSIFY_WITHOUT_MODEL,
        CommandKind::Classify if err.is_missing(Prerequisite::TestImage) => {
            "Failed to load test data."
        }
        CommandKind::Classify => CLASSIFY_WITHOUT_MODEL,
    };
    LogEntry::error(message)
}
