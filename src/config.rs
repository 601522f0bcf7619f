use std::path::{Path, PathBuf};

use burn::config::Config;

use crate::training::CHECKPOINT_EXTENSION;

/// File looked up in the working directory at startup.
pub const CONFIG_FILE: &str = "classifier.json";

#[derive(Config, Debug)]
pub struct AppConfig {
    /// Directory receiving the checkpoint, the history plot and the log file.
    #[config(default = "String::from(\"artifacts\")")]
    pub artifact_dir: String,

    #[config(default = "String::from(\"model_best\")")]
    pub checkpoint_name: String,

    #[config(default = "String::from(\"training_history.png\")")]
    pub plot_name: String,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 4)]
    pub train_workers: usize,

    #[config(default = 10)]
    pub default_epochs: usize,

    #[config(default = 10)]
    pub min_epochs: usize,

    #[config(default = 30)]
    pub max_epochs: usize,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

/// Where the values of an [`AppConfig`] came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
    /// The file exists but could not be read; defaults are used instead.
    Rejected { path: PathBuf, reason: String },
}

impl ConfigSource {
    /// Log the outcome. Called once the subscriber is installed.
    pub fn report(&self) {
        match self {
            ConfigSource::Defaults => tracing::info!("No configuration file, using defaults"),
            ConfigSource::File(path) => {
                tracing::info!("Loaded configuration from {}", path.display())
            }
            ConfigSource::Rejected { path, reason } => {
                tracing::warn!("Ignoring configuration at {}: {reason}", path.display())
            }
        }
    }
}

impl AppConfig {
    /// Load `path` if it exists, defaults otherwise. A present but malformed
    /// file falls back to defaults and is reported through the returned source.
    pub fn load_or_default(path: &Path) -> (Self, ConfigSource) {
        if !path.exists() {
            return (Self::new(), ConfigSource::Defaults);
        }
        match Self::load(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(err) => (
                Self::new(),
                ConfigSource::Rejected {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                },
            ),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        PathBuf::from(&self.artifact_dir)
    }

    /// Checkpoint path without extension; the recorder appends its own.
    pub fn checkpoint_stem(&self) -> PathBuf {
        self.artifact_dir().join(&self.checkpoint_name)
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_stem().with_extension(CHECKPOINT_EXTENSION)
    }

    pub fn plot_path(&self) -> PathBuf {
        self.artifact_dir().join(&self.plot_name)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.artifact_dir().join("logs")
    }

    /// Clamp a user supplied epoch count into the spinner range.
    pub fn clamp_epochs(&self, epochs: usize) -> usize {
        epochs.clamp(self.min_epochs, self.max_epochs.max(self.min_epochs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let (config, source) = AppConfig::load_or_default(&dir.path().join(CONFIG_FILE));
        assert_eq!(source, ConfigSource::Defaults);
        assert_eq!(config.default_epochs, 10);
        assert_eq!(config.checkpoint_file(), PathBuf::from("artifacts/model_best.mpk"));
        assert_eq!(config.plot_path(), PathBuf::from("artifacts/training_history.png"));
    }

    #[test]
    fn saved_overrides_are_picked_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        AppConfig::new()
            .with_artifact_dir("out".to_string())
            .with_max_epochs(50)
            .save(&path)
            .unwrap();

        let (config, source) = AppConfig::load_or_default(&path);
        assert_eq!(source, ConfigSource::File(path));
        assert_eq!(config.artifact_dir(), PathBuf::from("out"));
        assert_eq!(config.clamp_epochs(45), 45);
        assert_eq!(config.clamp_epochs(3), 10);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let (config, source) = AppConfig::load_or_default(&path);
        assert_eq!(config.seed, 42);
        assert!(matches!(source, ConfigSource::Rejected { path: rejected, .. } if rejected == path));
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejected_file_is_reported_as_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[1, 2").unwrap();
        let (_, source) = AppConfig::load_or_default(&path);

        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || source.report());

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("Ignoring configuration at"));
    }
}
