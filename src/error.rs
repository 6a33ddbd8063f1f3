// src/error.rs

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to read configuration from {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("at least one output variable is required")]
    NoOutputVariables,

    #[error("output variable #{0} has an empty NAME")]
    EmptyHeadName(usize),

    #[error("duplicate output variable NAME: {0}")]
    DuplicateHeadName(String),

    #[error("learning rate must be positive and finite, got {0}")]
    InvalidLearningRate(f64),

    /// `shape` is `[height, width, channels]` as configured.
    #[error("invalid input shape {shape:?}: {reason}")]
    InvalidInputShape { shape: [usize; 3], reason: String },

    #[error("pretrained weights '{id}' not found (looked for {path})")]
    WeightsNotFound { id: String, path: PathBuf },

    /// The backbone's layers disagree with the configuration it is compiled with.
    #[error("backbone does not match its configuration: {0}")]
    BackboneMismatch(String),

    #[error("no target supplied for output '{0}'")]
    MissingTarget(String),

    #[error("recorder error on {path}: {reason}")]
    Recorder { path: PathBuf, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PrepareError {
    pub fn config(path: &Path, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn input_shape(shape: [usize; 3], reason: impl Into<String>) -> Self {
        Self::InvalidInputShape {
            shape,
            reason: reason.into(),
        }
    }

    pub fn recorder(path: &Path, reason: impl ToString) -> Self {
        Self::Recorder {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrepareError>;
