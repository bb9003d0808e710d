//! Batch collation.

use fsdet_types::Annotation;

use crate::error::{DatasetError, Result};
use crate::sample::DetectionSample;

/// A stacked episode batch.
///
/// Images are concatenated into one NCHW buffer; annotation lists stay per
/// image because their lengths differ.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    /// Pixel data in NCHW layout.
    pub images: Vec<f32>,
    /// Number of images.
    pub batch_size: usize,
    /// Channel count.
    pub channels: usize,
    /// Image height.
    pub height: usize,
    /// Image width.
    pub width: usize,
    /// Ground-truth objects per image.
    pub targets: Vec<Vec<Annotation>>,
}

impl DetectionBatch {
    /// Returns the NCHW shape.
    #[must_use]
    pub const fn shape(&self) -> [usize; 4] {
        [self.batch_size, self.channels, self.height, self.width]
    }

    /// Total number of annotated objects in the batch.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.targets.iter().map(Vec::len).sum()
    }

    /// Splits the batch into contiguous shards of at most `shards` parts.
    ///
    /// Used to fan a batch out across devices; every shard is non-empty and
    /// the shards together cover the batch in order.
    #[must_use]
    pub fn shard(&self, shards: usize) -> Vec<Self> {
        let shards = shards.clamp(1, self.batch_size.max(1));
        let base = self.batch_size / shards;
        let extra = self.batch_size % shards;
        let per_image = self.channels * self.height * self.width;

        let mut out = Vec::with_capacity(shards);
        let mut start = 0;
        for k in 0..shards {
            let len = base + usize::from(k < extra);
            if len == 0 {
                continue;
            }
            out.push(Self {
                images: self.images[start * per_image..(start + len) * per_image].to_vec(),
                batch_size: len,
                channels: self.channels,
                height: self.height,
                width: self.width,
                targets: self.targets[start..start + len].to_vec(),
            });
            start += len;
        }
        out
    }
}

/// Stacks samples into a [`DetectionBatch`].
///
/// # Errors
///
/// Returns [`DatasetError::EmptyDataset`] for no samples,
/// [`DatasetError::InvalidDimensions`] for a malformed sample and
/// [`DatasetError::ShapeMismatch`] when sample shapes differ.
pub fn detection_collate(samples: Vec<DetectionSample>) -> Result<DetectionBatch> {
    let Some(first) = samples.first() else {
        return Err(DatasetError::EmptyDataset);
    };
    let expected = first.shape();
    let per_image = first.expected_image_len();

    let mut images = Vec::with_capacity(per_image * samples.len());
    let mut targets = Vec::with_capacity(samples.len());
    let batch_size = samples.len();
    for sample in samples {
        if !sample.is_valid() {
            let (c, h, w) = sample.shape();
            return Err(DatasetError::invalid_dimensions(c, h, w));
        }
        if sample.shape() != expected {
            return Err(DatasetError::ShapeMismatch {
                expected,
                actual: sample.shape(),
            });
        }
        images.extend_from_slice(&sample.image_chw);
        targets.push(sample.annotations);
    }

    let (c, h, w) = expected;
    Ok(DetectionBatch {
        images,
        batch_size,
        channels: c as usize,
        height: h as usize,
        width: w as usize,
        targets,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fsdet_types::BoundingBox;

    fn sample(fill: f32, objects: usize) -> DetectionSample {
        let ann = Annotation::new(BoundingBox::new(0.1, 0.1, 0.5, 0.5), 1);
        DetectionSample::new(vec![fill; 3 * 2 * 2], 3, 2, 2, vec![ann; objects])
    }

    #[test]
    fn collate_stacks_in_order() {
        let batch = detection_collate(vec![sample(1.0, 1), sample(2.0, 3)]).unwrap();
        assert_eq!(batch.shape(), [2, 3, 2, 2]);
        assert_eq!(batch.images.len(), 24);
        assert!(batch.images[..12].iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
        assert!(batch.images[12..].iter().all(|&v| (v - 2.0).abs() < f32::EPSILON));
        assert_eq!(batch.targets[1].len(), 3);
        assert_eq!(batch.num_objects(), 4);
    }

    #[test]
    fn collate_rejects_mixed_shapes() {
        let odd = DetectionSample::new(vec![0.0; 3], 3, 1, 1, Vec::new());
        assert!(matches!(
            detection_collate(vec![sample(0.0, 0), odd]),
            Err(DatasetError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn collate_rejects_empty() {
        assert!(matches!(
            detection_collate(Vec::new()),
            Err(DatasetError::EmptyDataset)
        ));
    }

    #[test]
    fn shard_covers_batch() {
        let samples = (0..5).map(|i| sample(i as f32, i)).collect();
        let batch = detection_collate(samples).unwrap();
        let shards = batch.shard(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].batch_size, 3);
        assert_eq!(shards[1].batch_size, 2);
        assert_eq!(shards[1].targets[0].len(), 3);
        assert!((shards[1].images[0] - 3.0).abs() < f32::EPSILON);

        assert_eq!(batch.shard(8).len(), 5);
        assert_eq!(batch.shard(0).len(), 1);
    }
}
