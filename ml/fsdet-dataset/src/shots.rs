//! Per-class shot selection.
//!
//! A few-shot task sees at most `n_shot` images per class. [`ShotIndex`]
//! fixes which images those are (seeded, so a run is reproducible) and lets
//! the loader draw one of them for every class slot of an episode.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::DetectionDataset;
use crate::error::{DatasetError, Result};

/// Mapping from 0-based class slot to the sample indices usable as shots.
///
/// # Example
///
/// ```
/// use fsdet_dataset::{ShotIndex, SyntheticConfig, SyntheticDataset};
///
/// let dataset = SyntheticDataset::new(SyntheticConfig::default().with_num_classes(3));
/// let index = ShotIndex::build(&dataset, 2, 7).unwrap();
///
/// assert_eq!(index.num_classes(), 3);
/// assert!(index.shots(0).len() <= 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotIndex {
    n_shot: usize,
    classes: Vec<Vec<usize>>,
}

impl ShotIndex {
    /// Scans `dataset` and keeps up to `n_shot` samples per class.
    ///
    /// A sample belongs to class `c` when any of its objects carries label
    /// `c + 1`. Candidates are shuffled with a `ChaCha8` RNG seeded by `seed`
    /// before truncation.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::EmptyDataset`] for an empty dataset,
    /// [`DatasetError::InvalidConfig`] when `n_shot` is zero, and
    /// [`DatasetError::EmptyClass`] when a class has no sample at all.
    pub fn build<D: DetectionDataset + ?Sized>(
        dataset: &D,
        n_shot: usize,
        seed: u64,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(DatasetError::EmptyDataset);
        }
        if n_shot == 0 {
            return Err(DatasetError::invalid_config("n_shot must be positive"));
        }

        let num_classes = dataset.num_classes();
        let mut classes = vec![Vec::new(); num_classes];
        for index in 0..dataset.len() {
            for label in dataset.labels_of(index)? {
                let Some(slot) = (label as usize).checked_sub(1) else {
                    continue;
                };
                if let Some(members) = classes.get_mut(slot) {
                    if members.last() != Some(&index) {
                        members.push(index);
                    }
                }
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for (class, members) in classes.iter_mut().enumerate() {
            if members.is_empty() {
                return Err(DatasetError::EmptyClass { class });
            }
            members.shuffle(&mut rng);
            members.truncate(n_shot);
            debug!(class, shots = members.len(), "Selected shots");
        }

        Ok(Self { n_shot, classes })
    }

    /// Creates an index from explicit per-class sample lists.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::EmptyClass`] if any list is empty.
    pub fn from_classes(n_shot: usize, classes: Vec<Vec<usize>>) -> Result<Self> {
        if let Some(class) = classes.iter().position(Vec::is_empty) {
            return Err(DatasetError::EmptyClass { class });
        }
        Ok(Self { n_shot, classes })
    }

    /// Number of class slots.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Shot budget per class.
    #[must_use]
    pub const fn n_shot(&self) -> usize {
        self.n_shot
    }

    /// Sample indices kept for `class`; empty for an unknown class.
    #[must_use]
    pub fn shots(&self, class: usize) -> &[usize] {
        self.classes.get(class).map_or(&[], Vec::as_slice)
    }

    /// Draws one sample index of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::EmptyClass`] if `class` is unknown.
    pub fn pick<R: rand::Rng + ?Sized>(&self, class: usize, rng: &mut R) -> Result<usize> {
        self.shots(class)
            .choose(rng)
            .copied()
            .ok_or(DatasetError::EmptyClass { class })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dataset::InMemoryDataset;
    use crate::sample::DetectionSample;
    use fsdet_types::{Annotation, BoundingBox};

    fn dataset(labels: &[u32], num_classes: usize) -> InMemoryDataset {
        let samples = labels
            .iter()
            .map(|&label| {
                DetectionSample::new(
                    vec![0.0; 3],
                    3,
                    1,
                    1,
                    vec![Annotation::new(BoundingBox::new(0.2, 0.2, 0.8, 0.8), label)],
                )
            })
            .collect();
        InMemoryDataset::new(samples, num_classes)
    }

    #[test]
    fn build_caps_shots_per_class() {
        let ds = dataset(&[1, 1, 1, 1, 2, 2], 2);
        let index = ShotIndex::build(&ds, 3, 0).unwrap();
        assert_eq!(index.shots(0).len(), 3);
        assert_eq!(index.shots(1).len(), 2);
        assert!(index.shots(0).iter().all(|&i| i < 4));
        assert!(index.shots(1).iter().all(|&i| i >= 4));
    }

    #[test]
    fn build_is_seeded() {
        let ds = dataset(&[1, 1, 1, 1, 1, 1, 1, 1], 1);
        let a = ShotIndex::build(&ds, 2, 11).unwrap();
        let b = ShotIndex::build(&ds, 2, 11).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn build_rejects_missing_class() {
        let ds = dataset(&[1, 1], 2);
        assert!(matches!(
            ShotIndex::build(&ds, 1, 0),
            Err(DatasetError::EmptyClass { class: 1 })
        ));
    }

    #[test]
    fn build_rejects_empty_dataset() {
        let ds = dataset(&[], 2);
        assert!(matches!(
            ShotIndex::build(&ds, 1, 0),
            Err(DatasetError::EmptyDataset)
        ));
    }

    #[test]
    fn pick_returns_member() {
        let index = ShotIndex::from_classes(2, vec![vec![4, 9], vec![1]]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..10 {
            assert!([4, 9].contains(&index.pick(0, &mut rng).unwrap()));
        }
        assert_eq!(index.pick(1, &mut rng).unwrap(), 1);
        assert!(index.pick(2, &mut rng).is_err());
    }
}
