use std::{fmt, path::PathBuf};

/// Coarse classification every component error maps onto.
///
/// The controller picks what to show the user from the tag alone; the full
/// error is only written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingPrerequisite,
    NotFound,
    InternalFailure,
}

/// Entities a command can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    Model,
    TrainingData,
    ValidationData,
    TestImage,
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Prerequisite::Model => "model",
            Prerequisite::TrainingData => "training dataset",
            Prerequisite::ValidationData => "validation dataset",
            Prerequisite::TestImage => "test image",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing prerequisite: {}", list(.0))]
    MissingPrerequisite(Vec<Prerequisite>),
    #[error("{} not found or not usable: {reason}", path.display())]
    NotFound { path: PathBuf, reason: String },
    #[error("selection cancelled")]
    Cancelled,
    #[error("internal failure: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap any component error according to its tag.
    pub fn from_component<E>(path: Option<PathBuf>, error: E) -> Self
    where
        E: std::error::Error + Tagged,
    {
        match (error.kind(), path) {
            (ErrorKind::NotFound, Some(path)) => AppError::NotFound {
                path,
                reason: error.to_string(),
            },
            (ErrorKind::NotFound, None) => AppError::NotFound {
                path: PathBuf::new(),
                reason: error.to_string(),
            },
            (ErrorKind::MissingPrerequisite, _) => AppError::MissingPrerequisite(Vec::new()),
            (ErrorKind::InternalFailure, _) => AppError::Internal(error.to_string()),
        }
    }

    pub fn is_missing(&self, prerequisite: Prerequisite) -> bool {
        matches!(self, AppError::MissingPrerequisite(missing) if missing.contains(&prerequisite))
    }
}

/// Implemented by every component error so the controller can route it.
pub trait Tagged {
    fn kind(&self) -> ErrorKind;
}

fn list(missing: &[Prerequisite]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
