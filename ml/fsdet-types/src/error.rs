//! Error types for fsdet-types crate.

use thiserror::Error;

/// Errors that can occur when building detection value types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Invalid bounding box coordinates.
    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    /// Class label outside `1..=n_way`.
    #[error("invalid label {label}: expected 1..={n_way}")]
    InvalidLabel {
        /// The invalid label.
        label: u32,
        /// Number of foreground classes.
        n_way: u32,
    },

    /// Data size mismatch.
    #[error("data size mismatch: expected {expected}, got {actual}")]
    DataSizeMismatch {
        /// Expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },
}

impl TypesError {
    /// Creates an invalid bounding box error.
    #[must_use]
    pub fn invalid_bounding_box(reason: impl Into<String>) -> Self {
        Self::InvalidBoundingBox(reason.into())
    }

    /// Creates a data size mismatch error.
    #[must_use]
    pub const fn data_size_mismatch(expected: usize, actual: usize) -> Self {
        Self::DataSizeMismatch { expected, actual }
    }
}

/// Result type for fsdet-types operations.
pub type Result<T> = std::result::Result<T, TypesError>;
