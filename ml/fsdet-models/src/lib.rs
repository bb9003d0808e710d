//! Detector architectures, priors and checkpoint persistence for few-shot training.
//!
//! This crate provides the imprintable RFB-style detector built with the Burn
//! framework, the prior generator whose layout the detector's heads follow,
//! and named state-dict checkpoints.
//!
//! # Model Architectures
//!
//! - [`ImprintedRfb`] - single-shot detector with a three-stage cosine classifier
//! - [`DenseLayer`] - one imprintable classifier stage
//!
//! Anything implementing [`DetectionNetwork`] can be imprinted and fine-tuned.
//!
//! # Priors
//!
//! [`PriorBox`] tiles the source feature maps described by a
//! [`PriorBoxConfig`]; presets exist for VOC and COCO at 300 and 512 pixels.
//!
//! # Checkpoint Persistence
//!
//! [`StateDict`] maps parameter paths to tensors and is written as:
//! - Binary format (compact, fast)
//! - JSON format (human-readable, debuggable)
//!
//! Loading strips the data-parallel `module.` prefix and reports missing or
//! unexpected keys instead of failing.
//!
//! # Example
//!
//! ```
//! use fsdet_models::{Architecture, DatasetKind, RfbConfig};
//!
//! let config = RfbConfig::for_selection(Architecture::RfbVgg, DatasetKind::Voc, 300).unwrap();
//! assert_eq!(config.priors.num_priors(), 11620);
//! assert!(config.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod checkpoint;
mod denselayer;
mod error;
mod network;
mod prior;
mod rfb;

// Re-export model types
pub use denselayer::{DenseLayer, NORM_EPSILON, Stage, StageNorm, l2_normalize_rows};
pub use network::{DetectionNetwork, DetectionOutput, GradientGroup, GradientGroups};
pub use rfb::{
    Architecture, BASE_LR_FACTOR, DatasetKind, EXTRAS_LR_FACTOR, ImprintedRfb, RfbConfig,
};

// Re-export prior generation
pub use prior::{DEFAULT_VARIANCE, PriorBox, PriorBoxConfig, PriorPreset};

// Re-export checkpoint utilities
pub use checkpoint::{CheckpointFormat, LoadReport, PARALLEL_PREFIX, StateDict, TensorEntry};

// Re-export error types
pub use error::{ModelError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        Architecture, CheckpointFormat, DatasetKind, DenseLayer, DetectionNetwork,
        DetectionOutput, GradientGroups, ImprintedRfb, ModelError, PriorBox, PriorBoxConfig,
        RfbConfig, Stage, StateDict,
    };
}
