//! Error types for fsdet-training crate.

use thiserror::Error;

/// Errors that can occur during imprinting and fine-tuning.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Invalid training configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model error.
    #[error("model error: {0}")]
    Model(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Loss computation error.
    #[error("loss error: {0}")]
    Loss(String),

    /// A class received no positive priors during imprinting.
    #[error("no positive priors for class {class} while imprinting stage {stage}")]
    InsufficientData {
        /// 1-based stage number.
        stage: usize,
        /// 0-based class slot.
        class: usize,
    },

    /// The episode stream ended before the requested number of episodes.
    #[error("episode stream exhausted after {delivered} of {expected} episodes")]
    EpisodesExhausted {
        /// Episodes requested.
        expected: usize,
        /// Episodes received.
        delivered: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl TrainingError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a dataset error.
    #[must_use]
    pub fn dataset(reason: impl Into<String>) -> Self {
        Self::Dataset(reason.into())
    }

    /// Creates a model error.
    #[must_use]
    pub fn model(reason: impl Into<String>) -> Self {
        Self::Model(reason.into())
    }

    /// Creates a checkpoint error.
    #[must_use]
    pub fn checkpoint(reason: impl Into<String>) -> Self {
        Self::Checkpoint(reason.into())
    }

    /// Creates a loss error.
    #[must_use]
    pub fn loss(reason: impl Into<String>) -> Self {
        Self::Loss(reason.into())
    }

    /// Creates an insufficient data error.
    #[must_use]
    pub const fn insufficient_data(stage: usize, class: usize) -> Self {
        Self::InsufficientData { stage, class }
    }

    /// Creates an IO error.
    #[must_use]
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io(reason.into())
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<fsdet_dataset::DatasetError> for TrainingError {
    fn from(err: fsdet_dataset::DatasetError) -> Self {
        Self::Dataset(err.to_string())
    }
}

impl From<fsdet_models::ModelError> for TrainingError {
    fn from(err: fsdet_models::ModelError) -> Self {
        match err {
            fsdet_models::ModelError::LoadCheckpoint { .. }
            | fsdet_models::ModelError::SaveCheckpoint { .. }
            | fsdet_models::ModelError::CheckpointNotFound(_)
            | fsdet_models::ModelError::UnsupportedFormat(_) => Self::Checkpoint(err.to_string()),
            fsdet_models::ModelError::InvalidConfig(_)
            | fsdet_models::ModelError::UnknownArchitecture(_) => {
                Self::InvalidConfig(err.to_string())
            }
            _ => Self::Model(err.to_string()),
        }
    }
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainingError>;
