//! Weight imprinting and episodic fine-tuning for few-shot RFB detectors.
//!
//! Training runs in two phases on an [`fsdet_models::ImprintedRfb`]:
//!
//! 1. **Imprinting** - [`ImprintingEngine`] synthesizes the rows of the three
//!    cascaded classifier stages from support episodes: every positive prior
//!    contributes its normalized stage composite to its class, and the
//!    per-class mean, normalized again, becomes that class's row.
//! 2. **Fine-tuning** - [`Trainer`] runs episodic SGD with the
//!    [`MultiBoxLoss`], per-group learning rates and a multi-step schedule,
//!    renormalizing the classifier rows after every step.
//!
//! # Components
//!
//! - [`TrainingConfig`] - Run configuration
//! - [`TargetBatch`] / [`match_priors`] - Prior-to-truth matching and box encoding
//! - [`MultiBoxLoss`] - Localization, class and objectness loss with hard negative mining
//! - [`ExecutionStrategy`] - Single-device or data-parallel backward passes
//! - [`TrainingMetrics`] / [`ScalarLogger`] - Epoch summaries and scalar logs
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use burn::backend::Autodiff;
//! use burn_ndarray::NdArray;
//! use fsdet_dataset::{EpisodeLoader, ShotIndex, SyntheticConfig, SyntheticDataset};
//! use fsdet_training::{ExecutionStrategy, Trainer, TrainingConfig};
//!
//! let dataset = SyntheticDataset::new(SyntheticConfig::default());
//! let shots = ShotIndex::build(&dataset, 5, 0)?;
//! let loader = EpisodeLoader::new(Arc::new(dataset), Arc::new(shots), 4);
//!
//! let trainer = Trainer::new(TrainingConfig::default())?;
//! let strategy = ExecutionStrategy::<Autodiff<NdArray>>::replicated(&Default::default(), 1)?;
//! let outcome = trainer.run(&loader, &strategy)?;
//! println!("{}", outcome.state.metrics.summary());
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod error;
mod imprint;
mod loss;
mod matching;
mod metrics;
mod strategy;
mod trainer;

pub use config::{LearningRateSchedule, OptimizerConfig, TrainingConfig, ZeroPositivePolicy};

pub use imprint::{
    ImprintReport, ImprintingEngine, StageDescriptor, StageInput, StageReport, stage_composite,
};

pub use loss::{LossComponents, LossValues, MultiBoxLoss, smooth_l1};

pub use matching::{
    TargetBatch, center_size, decode, encode, jaccard, match_priors, point_form,
};

pub use metrics::{EpochMetrics, ScalarLogger, ScalarRecord, TrainingMetrics, read_scalars};

pub use strategy::{BackwardStep, ExecutionStrategy, batch_images};

pub use trainer::{Trainer, TrainingOutcome, TrainingState};

pub use error::{Result, TrainingError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        EpochMetrics, ExecutionStrategy, ImprintReport, ImprintingEngine, LearningRateSchedule,
        LossValues, MultiBoxLoss, OptimizerConfig, TargetBatch, Trainer, TrainingConfig,
        TrainingError, TrainingMetrics, TrainingOutcome, TrainingState, ZeroPositivePolicy,
    };
}
