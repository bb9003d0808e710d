//! Episodic batch sampling.
//!
//! An episode is one batch of class slots. During training each episode
//! draws `n_way` distinct classes at random; support and test phases walk the
//! classes in order so every class is visited evenly.

use std::fmt;
use std::str::FromStr;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// Sampling phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerPhase {
    /// Random class permutation per episode.
    #[default]
    Train,
    /// In-order classes, used while imprinting from a fixed support set.
    Support,
    /// In-order classes for evaluation.
    Test,
}

impl SamplerPhase {
    /// Returns the phase name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Support => "support",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SamplerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SamplerPhase {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "support" | "test_support" => Ok(Self::Support),
            "test" => Ok(Self::Test),
            other => Err(DatasetError::invalid_config(format!(
                "unknown sampler phase: {other}"
            ))),
        }
    }
}

/// Produces a finite sequence of episodes, each a list of class slots.
///
/// # Example
///
/// ```
/// use fsdet_dataset::{EpisodicBatchSampler, SamplerPhase};
///
/// let sampler = EpisodicBatchSampler::new(20, 5, 3, SamplerPhase::Train, 42).unwrap();
/// let episodes: Vec<Vec<usize>> = sampler.iter().collect();
///
/// assert_eq!(episodes.len(), 3);
/// assert!(episodes.iter().all(|e| e.len() == 5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodicBatchSampler {
    n_classes: usize,
    n_way: usize,
    n_episodes: usize,
    phase: SamplerPhase,
    seed: u64,
}

impl EpisodicBatchSampler {
    /// Creates a sampler.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::InvalidConfig`] if `n_classes` or `n_way` is
    /// zero.
    pub fn new(
        n_classes: usize,
        n_way: usize,
        n_episodes: usize,
        phase: SamplerPhase,
        seed: u64,
    ) -> Result<Self> {
        if n_classes == 0 {
            return Err(DatasetError::invalid_config("n_classes must be positive"));
        }
        if n_way == 0 {
            return Err(DatasetError::invalid_config("n_way must be positive"));
        }
        Ok(Self {
            n_classes,
            n_way,
            n_episodes,
            phase,
            seed,
        })
    }

    /// Returns a sampler for `epoch` with a seed derived from the base seed.
    #[must_use]
    pub const fn for_epoch(&self, epoch: usize) -> Self {
        Self {
            seed: self
                .seed
                .wrapping_add((epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ..*self
        }
    }

    /// Number of classes sampled from.
    #[must_use]
    pub const fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Class slots per episode.
    #[must_use]
    pub const fn n_way(&self) -> usize {
        self.n_way
    }

    /// Episodes per pass.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.n_episodes
    }

    /// Returns `true` if the sampler yields no episodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.n_episodes == 0
    }

    /// Sampling phase.
    #[must_use]
    pub const fn phase(&self) -> SamplerPhase {
        self.phase
    }

    /// Seed of the episode RNG.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns a fresh iterator over the episodes.
    #[must_use]
    pub fn iter(&self) -> EpisodeIter {
        EpisodeIter {
            sampler: *self,
            episode: 0,
            cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
        }
    }
}

impl IntoIterator for &EpisodicBatchSampler {
    type Item = Vec<usize>;
    type IntoIter = EpisodeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the episodes of an [`EpisodicBatchSampler`].
#[derive(Debug, Clone)]
pub struct EpisodeIter {
    sampler: EpisodicBatchSampler,
    episode: usize,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl EpisodeIter {
    fn random_episode(&mut self) -> Vec<usize> {
        let n_classes = self.sampler.n_classes;
        let mut slots = Vec::with_capacity(self.sampler.n_way);
        let mut perm: Vec<usize> = (0..n_classes).collect();
        while slots.len() < self.sampler.n_way {
            perm.shuffle(&mut self.rng);
            let take = (self.sampler.n_way - slots.len()).min(n_classes);
            slots.extend_from_slice(&perm[..take]);
        }
        slots
    }

    fn ordered_episode(&mut self) -> Vec<usize> {
        let n_classes = self.sampler.n_classes;
        let slots = (0..self.sampler.n_way)
            .map(|k| (self.cursor + k) % n_classes)
            .collect();
        self.cursor = (self.cursor + self.sampler.n_way) % n_classes;
        slots
    }
}

impl Iterator for EpisodeIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.episode >= self.sampler.n_episodes {
            return None;
        }
        self.episode += 1;
        Some(match self.sampler.phase {
            SamplerPhase::Train => self.random_episode(),
            SamplerPhase::Support | SamplerPhase::Test => self.ordered_episode(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.sampler.n_episodes - self.episode;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpisodeIter {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn yields_exact_episode_count() {
        let sampler = EpisodicBatchSampler::new(20, 20, 50, SamplerPhase::Train, 0).unwrap();
        let episodes: Vec<_> = sampler.iter().collect();
        assert_eq!(episodes.len(), 50);
        assert_eq!(sampler.iter().len(), 50);
    }

    #[test]
    fn train_episodes_are_distinct_and_in_range() {
        let sampler = EpisodicBatchSampler::new(20, 20, 10, SamplerPhase::Train, 5).unwrap();
        for episode in &sampler {
            assert_eq!(episode.len(), 20);
            let unique: HashSet<_> = episode.iter().copied().collect();
            assert_eq!(unique.len(), 20);
            assert!(episode.iter().all(|&c| c < 20));
        }
    }

    #[test]
    fn train_prefix_is_subset_when_fewer_ways() {
        let sampler = EpisodicBatchSampler::new(20, 5, 20, SamplerPhase::Train, 9).unwrap();
        for episode in &sampler {
            let unique: HashSet<_> = episode.iter().copied().collect();
            assert_eq!(unique.len(), 5);
        }
    }

    #[test]
    fn train_wraps_when_more_ways_than_classes() {
        let sampler = EpisodicBatchSampler::new(3, 7, 4, SamplerPhase::Train, 1).unwrap();
        for episode in &sampler {
            assert_eq!(episode.len(), 7);
            for class in 0..3 {
                let count = episode.iter().filter(|&&c| c == class).count();
                assert!((2..=3).contains(&count));
            }
        }
    }

    #[test]
    fn same_seed_same_episodes() {
        let a = EpisodicBatchSampler::new(20, 20, 5, SamplerPhase::Train, 77).unwrap();
        let b = EpisodicBatchSampler::new(20, 20, 5, SamplerPhase::Train, 77).unwrap();
        assert_eq!(a.iter().collect::<Vec<_>>(), b.iter().collect::<Vec<_>>());
        assert_ne!(
            a.iter().collect::<Vec<_>>(),
            a.for_epoch(1).iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn support_phase_is_in_order_with_wraparound() {
        let sampler = EpisodicBatchSampler::new(5, 3, 3, SamplerPhase::Support, 0).unwrap();
        let episodes: Vec<_> = sampler.iter().collect();
        assert_eq!(episodes, vec![vec![0, 1, 2], vec![3, 4, 0], vec![1, 2, 3]]);
    }

    #[test]
    fn zero_episodes_is_empty() {
        let sampler = EpisodicBatchSampler::new(5, 3, 0, SamplerPhase::Test, 0).unwrap();
        assert!(sampler.is_empty());
        assert_eq!(sampler.iter().next(), None);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(EpisodicBatchSampler::new(0, 3, 1, SamplerPhase::Train, 0).is_err());
        assert!(EpisodicBatchSampler::new(3, 0, 1, SamplerPhase::Train, 0).is_err());
    }

    #[test]
    fn phase_parsing() {
        assert_eq!("train".parse::<SamplerPhase>().unwrap(), SamplerPhase::Train);
        assert_eq!(
            "test_support".parse::<SamplerPhase>().unwrap(),
            SamplerPhase::Support
        );
        assert!("bogus".parse::<SamplerPhase>().is_err());
        assert_eq!(SamplerPhase::Test.to_string(), "test");
    }
}
