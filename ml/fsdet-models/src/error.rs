//! Error types for fsdet-models crate.

use thiserror::Error;

/// Errors that can occur in fsdet-models operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Failed to load checkpoint.
    #[error("failed to load checkpoint from {path}: {reason}")]
    LoadCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to save checkpoint.
    #[error("failed to save checkpoint to {path}: {reason}")]
    SaveCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Invalid model or prior configuration.
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    /// Checkpoint file not found.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Unsupported checkpoint format.
    #[error("unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    /// Shape mismatch when writing parameters.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Stage index outside `1..=3`.
    #[error("invalid denselayer stage {0}: expected 1, 2 or 3")]
    InvalidStage(usize),

    /// Unknown architecture selector.
    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),
}

impl ModelError {
    /// Creates a load checkpoint error.
    #[must_use]
    pub fn load_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a save checkpoint error.
    #[must_use]
    pub fn save_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SaveCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a checkpoint not found error.
    #[must_use]
    pub fn checkpoint_not_found(path: impl Into<String>) -> Self {
        Self::CheckpointNotFound(path.into())
    }

    /// Creates an unsupported format error.
    #[must_use]
    pub fn unsupported_format(path: impl Into<String>) -> Self {
        Self::UnsupportedFormat(path.into())
    }

    /// Creates a shape mismatch error from two dims lists.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

/// Result type for fsdet-models operations.
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_load_checkpoint() {
        let err = ModelError::load_checkpoint("/path/model.bin", "corrupted");
        assert!(err.to_string().contains("/path/model.bin"));
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn error_save_checkpoint() {
        let err = ModelError::save_checkpoint("/path/model.bin", "disk full");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn error_invalid_config() {
        let err = ModelError::invalid_config("steps must be positive");
        assert!(err.to_string().contains("steps must be positive"));
    }

    #[test]
    fn error_shape_mismatch() {
        let err = ModelError::shape_mismatch(&[20, 60], &[20, 80]);
        assert!(err.to_string().contains("[20, 60]"));
        assert!(err.to_string().contains("[20, 80]"));
    }

    #[test]
    fn error_invalid_stage() {
        let err = ModelError::InvalidStage(4);
        assert!(err.to_string().contains('4'));
    }
}
