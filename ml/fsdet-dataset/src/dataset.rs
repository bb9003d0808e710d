//! Dataset contract.

use crate::error::{DatasetError, Result};
use crate::sample::DetectionSample;

/// An indexable source of annotated detection images.
///
/// Implementations must be shareable with loader worker threads, so the
/// trait requires `Send + Sync`; [`DetectionDataset::get`] takes `&self` and
/// may be called concurrently.
pub trait DetectionDataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Returns `true` if the dataset holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads the sample at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range or the sample cannot be
    /// loaded.
    fn get(&self, index: usize) -> Result<DetectionSample>;

    /// Number of foreground classes; labels lie in `1..=num_classes()`.
    fn num_classes(&self) -> usize;

    /// Returns the labels present in sample `index`.
    ///
    /// The default loads the whole sample; implementations backed by an
    /// annotation index should override it.
    ///
    /// # Errors
    ///
    /// Propagates [`DetectionDataset::get`] errors.
    fn labels_of(&self, index: usize) -> Result<Vec<u32>> {
        Ok(self.get(index)?.annotations.iter().map(|a| a.label).collect())
    }
}

/// A dataset held fully in memory.
///
/// # Example
///
/// ```
/// use fsdet_dataset::{DetectionDataset, DetectionSample, InMemoryDataset};
///
/// let dataset = InMemoryDataset::new(
///     vec![DetectionSample::new(vec![0.0; 3], 3, 1, 1, Vec::new())],
///     20,
/// );
/// assert_eq!(dataset.len(), 1);
/// assert!(dataset.get(1).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<DetectionSample>,
    num_classes: usize,
}

impl InMemoryDataset {
    /// Creates a dataset from samples.
    #[must_use]
    pub const fn new(samples: Vec<DetectionSample>, num_classes: usize) -> Self {
        Self {
            samples,
            num_classes,
        }
    }

    /// Returns the samples.
    #[must_use]
    pub fn samples(&self) -> &[DetectionSample] {
        &self.samples
    }
}

impl DetectionDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<DetectionSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| DatasetError::index_out_of_range(index, self.samples.len()))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn labels_of(&self, index: usize) -> Result<Vec<u32>> {
        self.samples
            .get(index)
            .map(|s| s.annotations.iter().map(|a| a.label).collect())
            .ok_or_else(|| DatasetError::index_out_of_range(index, self.samples.len()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fsdet_types::{Annotation, BoundingBox};

    fn sample(label: u32) -> DetectionSample {
        DetectionSample::new(
            vec![0.0; 3],
            3,
            1,
            1,
            vec![Annotation::new(BoundingBox::new(0.1, 0.1, 0.9, 0.9), label)],
        )
    }

    #[test]
    fn in_memory_get() {
        let dataset = InMemoryDataset::new(vec![sample(1), sample(2)], 2);
        assert_eq!(dataset.len(), 2);
        assert!(!dataset.is_empty());
        assert_eq!(dataset.get(1).unwrap().annotations[0].label, 2);
        assert!(matches!(
            dataset.get(2),
            Err(DatasetError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn labels_of_matches_annotations() {
        let dataset = InMemoryDataset::new(vec![sample(3)], 5);
        assert_eq!(dataset.labels_of(0).unwrap(), vec![3]);
        assert_eq!(dataset.num_classes(), 5);
    }
}
