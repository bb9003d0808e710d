//! Episodic data pipeline for few-shot detection.
//!
//! This crate turns an annotated image collection into the balanced episode
//! batches that drive imprinting and fine-tuning:
//!
//! # Dataset Contract
//!
//! - [`DetectionDataset`] - Indexable source of [`DetectionSample`]s
//! - [`InMemoryDataset`] - Vector-backed implementation
//! - [`SyntheticDataset`] - Generated rectangles for tests and smoke runs
//!
//! # Episodes
//!
//! - [`ShotIndex`] - Up to `n_shot` sample indices per class
//! - [`EpisodicBatchSampler`] - Finite stream of class-slot episodes
//! - [`detection_collate`] - Stack samples into a [`DetectionBatch`]
//! - [`EpisodeLoader`] - Sampler + shots + dataset, with prefetch workers
//!
//! # Layer 0 Crate
//!
//! No tensor backend is involved; batches are flat NCHW buffers that the
//! model crates upload themselves.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fsdet_dataset::{
//!     EpisodeLoader, EpisodicBatchSampler, SamplerPhase, ShotIndex, SyntheticConfig,
//!     SyntheticDataset,
//! };
//!
//! let dataset = SyntheticDataset::new(SyntheticConfig::default().with_num_classes(5));
//! let shots = ShotIndex::build(&dataset, 5, 0).unwrap();
//! let loader = EpisodeLoader::new(Arc::new(dataset), Arc::new(shots), 0);
//!
//! let sampler = EpisodicBatchSampler::new(5, 5, 2, SamplerPhase::Train, 0).unwrap();
//! let batches: Vec<_> = loader.episodes(&sampler).collect();
//! assert_eq!(batches.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod collate;
mod dataset;
mod error;
mod loader;
mod sample;
mod sampler;
mod shots;
mod synthetic;

pub use collate::{DetectionBatch, detection_collate};
pub use dataset::{DetectionDataset, InMemoryDataset};
pub use loader::{DEFAULT_PREFETCH, EpisodeLoader, EpisodeStream, load_episode};
pub use sample::DetectionSample;
pub use sampler::{EpisodeIter, EpisodicBatchSampler, SamplerPhase};
pub use shots::ShotIndex;
pub use synthetic::{SyntheticConfig, SyntheticDataset};

pub use error::{DatasetError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        DatasetError, DetectionBatch, DetectionDataset, DetectionSample, EpisodeLoader,
        EpisodicBatchSampler, InMemoryDataset, SamplerPhase, ShotIndex, SyntheticConfig,
        SyntheticDataset, detection_collate,
    };
}
