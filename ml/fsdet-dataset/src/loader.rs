//! Episode loading with optional background prefetch.
//!
//! [`EpisodeLoader`] turns the class slots of each sampled episode into a
//! collated [`DetectionBatch`]: for every slot one of the class's shots is
//! drawn, loaded and stacked. With `num_workers > 0` episodes are produced by
//! worker threads over bounded channels; worker `w` owns the episodes whose
//! index is congruent to `w`, and the consumer reads the workers round-robin,
//! so batches arrive in episode order regardless of the worker count.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::collate::{DetectionBatch, detection_collate};
use crate::dataset::DetectionDataset;
use crate::error::{DatasetError, Result};
use crate::sampler::{EpisodeIter, EpisodicBatchSampler};
use crate::shots::ShotIndex;

/// Default number of episodes each worker may run ahead.
pub const DEFAULT_PREFETCH: usize = 2;

/// Builds episode batches from a dataset and its shot index.
#[derive(Clone)]
pub struct EpisodeLoader {
    dataset: Arc<dyn DetectionDataset>,
    shots: Arc<ShotIndex>,
    num_workers: usize,
    prefetch: usize,
}

impl std::fmt::Debug for EpisodeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeLoader")
            .field("samples", &self.dataset.len())
            .field("classes", &self.shots.num_classes())
            .field("num_workers", &self.num_workers)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

impl EpisodeLoader {
    /// Creates a loader; `num_workers == 0` loads on the calling thread.
    #[must_use]
    pub fn new(
        dataset: Arc<dyn DetectionDataset>,
        shots: Arc<ShotIndex>,
        num_workers: usize,
    ) -> Self {
        Self {
            dataset,
            shots,
            num_workers,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Sets how many episodes each worker may buffer.
    #[must_use]
    pub const fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    /// Returns the worker count.
    #[must_use]
    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns the shot index.
    #[must_use]
    pub fn shots(&self) -> &ShotIndex {
        &self.shots
    }

    /// Returns a stream of batches for one pass of `sampler`.
    #[must_use]
    pub fn episodes(&self, sampler: &EpisodicBatchSampler) -> EpisodeStream {
        if self.num_workers == 0 {
            return EpisodeStream {
                backend: StreamBackend::Immediate {
                    dataset: Arc::clone(&self.dataset),
                    shots: Arc::clone(&self.shots),
                    episodes: sampler.iter(),
                    seed: sampler.seed(),
                    index: 0,
                },
            };
        }

        let workers = self.num_workers.min(sampler.len().max(1));
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::sync_channel(self.prefetch.max(1));
            let dataset = Arc::clone(&self.dataset);
            let shots = Arc::clone(&self.shots);
            let sampler = *sampler;
            handles.push(thread::spawn(move || {
                let owned = sampler
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| index % workers == worker);
                for (index, classes) in owned {
                    let batch = load_episode(
                        dataset.as_ref(),
                        &shots,
                        &classes,
                        episode_seed(sampler.seed(), index),
                    );
                    if tx.send(batch).is_err() {
                        return;
                    }
                }
            }));
            receivers.push(rx);
        }
        debug!(workers, episodes = sampler.len(), "Spawned episode workers");

        EpisodeStream {
            backend: StreamBackend::Prefetch {
                receivers,
                handles,
                next: 0,
                total: sampler.len(),
            },
        }
    }
}

/// Loads and collates the batch for one episode.
///
/// # Errors
///
/// Propagates shot lookup, sample loading and collation errors.
pub fn load_episode(
    dataset: &dyn DetectionDataset,
    shots: &ShotIndex,
    classes: &[usize],
    seed: u64,
) -> Result<DetectionBatch> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let samples = classes
        .iter()
        .map(|&class| dataset.get(shots.pick(class, &mut rng)?))
        .collect::<Result<Vec<_>>>()?;
    detection_collate(samples)
}

fn episode_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_add(1).wrapping_mul(0xD6E8_FEB8_6659_FD93)
}

enum StreamBackend {
    Immediate {
        dataset: Arc<dyn DetectionDataset>,
        shots: Arc<ShotIndex>,
        episodes: EpisodeIter,
        seed: u64,
        index: usize,
    },
    Prefetch {
        receivers: Vec<Receiver<Result<DetectionBatch>>>,
        handles: Vec<thread::JoinHandle<()>>,
        next: usize,
        total: usize,
    },
}

/// Iterator over the batches of one sampler pass.
pub struct EpisodeStream {
    backend: StreamBackend,
}

impl Iterator for EpisodeStream {
    type Item = Result<DetectionBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            StreamBackend::Immediate {
                dataset,
                shots,
                episodes,
                seed,
                index,
            } => {
                let classes = episodes.next()?;
                let batch = load_episode(dataset.as_ref(), shots, &classes, episode_seed(*seed, *index));
                *index += 1;
                Some(batch)
            }
            StreamBackend::Prefetch {
                receivers,
                next,
                total,
                ..
            } => {
                if *next >= *total {
                    return None;
                }
                let rx = &receivers[*next % receivers.len()];
                let item = rx.recv().unwrap_or_else(|_| {
                    Err(DatasetError::worker(format!(
                        "worker for episode {next} exited early"
                    )))
                });
                *next += 1;
                Some(item)
            }
        }
    }
}

impl Drop for EpisodeStream {
    fn drop(&mut self) {
        if let StreamBackend::Prefetch {
            receivers, handles, ..
        } = &mut self.backend
        {
            // Workers blocked on a full channel unblock once it disconnects.
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
