//! Error types for fsdet-dataset crate.

use fsdet_types::TypesError;
use thiserror::Error;

/// Errors that can occur in fsdet-dataset operations.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Failed to load sample.
    #[error("failed to load sample {index}: {reason}")]
    LoadSample {
        /// Sample index.
        index: usize,
        /// Reason for failure.
        reason: String,
    },

    /// Sample index past the end of the dataset.
    #[error("sample index {index} out of range for dataset of {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// Invalid image dimensions.
    #[error("invalid image dimensions: {channels}x{height}x{width}")]
    InvalidDimensions {
        /// Channel count.
        channels: u32,
        /// Height in pixels.
        height: u32,
        /// Width in pixels.
        width: u32,
    },

    /// Empty dataset.
    #[error("dataset is empty")]
    EmptyDataset,

    /// A class has no sample that could serve as a shot.
    #[error("class {class} has no annotated samples")]
    EmptyClass {
        /// 0-based class slot.
        class: usize,
    },

    /// Samples in one batch disagree on their shape.
    #[error("batch shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape of the first sample `(c, h, w)`.
        expected: (u32, u32, u32),
        /// Offending shape.
        actual: (u32, u32, u32),
    },

    /// Invalid sampler or loader configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A prefetch worker stopped unexpectedly.
    #[error("loader worker failed: {0}")]
    Worker(String),

    /// Invalid value type.
    #[error(transparent)]
    Types(#[from] TypesError),
}

impl DatasetError {
    /// Creates a load sample error.
    #[must_use]
    pub fn load_sample(index: usize, reason: impl Into<String>) -> Self {
        Self::LoadSample {
            index,
            reason: reason.into(),
        }
    }

    /// Creates an index out of range error.
    #[must_use]
    pub const fn index_out_of_range(index: usize, len: usize) -> Self {
        Self::IndexOutOfRange { index, len }
    }

    /// Creates an invalid dimensions error.
    #[must_use]
    pub const fn invalid_dimensions(channels: u32, height: u32, width: u32) -> Self {
        Self::InvalidDimensions {
            channels,
            height,
            width,
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a worker error.
    #[must_use]
    pub fn worker(reason: impl Into<String>) -> Self {
        Self::Worker(reason.into())
    }
}

/// Result type for fsdet-dataset operations.
pub type Result<T> = std::result::Result<T, DatasetError>;
