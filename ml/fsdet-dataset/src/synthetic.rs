//! Procedurally generated detection data.
//!
//! Each sample is a flat background with one class-colored rectangle (and, on
//! every third sample, a smaller distractor of the next class). Samples are a
//! pure function of `(seed, index)`, which keeps loader output reproducible
//! across worker counts.

use fsdet_types::{Annotation, BoundingBox};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::DetectionDataset;
use crate::error::{DatasetError, Result};
use crate::sample::DetectionSample;

/// Synthetic dataset parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Number of foreground classes.
    pub num_classes: usize,
    /// Samples generated per class.
    pub samples_per_class: usize,
    /// Square image side in pixels.
    pub image_size: u32,
    /// Base seed.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_classes: 20,
            samples_per_class: 5,
            image_size: 64,
            seed: 0,
        }
    }
}

impl SyntheticConfig {
    /// Sets the class count.
    #[must_use]
    pub const fn with_num_classes(mut self, n: usize) -> Self {
        self.num_classes = n;
        self
    }

    /// Sets samples per class.
    #[must_use]
    pub const fn with_samples_per_class(mut self, n: usize) -> Self {
        self.samples_per_class = n;
        self
    }

    /// Sets the image side.
    #[must_use]
    pub const fn with_image_size(mut self, size: u32) -> Self {
        self.image_size = size;
        self
    }

    /// Sets the seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A dataset of generated rectangles.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticDataset {
    config: SyntheticConfig,
}

impl SyntheticDataset {
    /// Channels per generated image.
    pub const CHANNELS: u32 = 3;

    /// Creates the dataset.
    #[must_use]
    pub const fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn class_of(&self, index: usize) -> usize {
        index % self.config.num_classes.max(1)
    }

    fn class_color(class: usize, channel: usize) -> f32 {
        let level = (class * 37 + channel * 91 + 40) % 255;
        #[allow(clippy::cast_precision_loss)]
        let level = level as f32;
        level / 255.0 - 0.5
    }

    fn random_box(rng: &mut ChaCha8Rng, min_side: f32, max_side: f32) -> BoundingBox {
        let w = rng.gen_range(min_side..max_side);
        let h = rng.gen_range(min_side..max_side);
        let x0 = rng.gen_range(0.0..1.0 - w);
        let y0 = rng.gen_range(0.0..1.0 - h);
        BoundingBox::new(x0, y0, x0 + w, y0 + h)
    }

    fn objects(&self, index: usize) -> Vec<Annotation> {
        let mut rng = ChaCha8Rng::seed_from_u64(
            self.config.seed ^ (index as u64).wrapping_mul(0x2545_F491_4F6C_DD1D),
        );
        let class = self.class_of(index);
        let mut objects = vec![Annotation::new(
            Self::random_box(&mut rng, 0.3, 0.6),
            label(class),
        )];
        if index % 3 == 0 && self.config.num_classes > 1 {
            let other = (class + 1) % self.config.num_classes;
            objects.push(Annotation::new(
                Self::random_box(&mut rng, 0.1, 0.25),
                label(other),
            ));
        }
        objects
    }

    fn render(&self, objects: &[Annotation]) -> Vec<f32> {
        let side = self.config.image_size as usize;
        let channels = Self::CHANNELS as usize;
        let mut image = vec![0.0; channels * side * side];
        #[allow(clippy::cast_precision_loss)]
        let scale = side as f32;
        for object in objects {
            let class = object.class_slot().unwrap_or_default();
            let to_px = |v: f32| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let px = (v * scale).round() as usize;
                px.min(side)
            };
            let (x0, x1) = (to_px(object.bbox.x0), to_px(object.bbox.x1));
            let (y0, y1) = (to_px(object.bbox.y0), to_px(object.bbox.y1));
            for c in 0..channels {
                let value = Self::class_color(class, c);
                for y in y0..y1 {
                    let row = (c * side + y) * side;
                    image[row + x0..row + x1].fill(value);
                }
            }
        }
        image
    }
}

fn label(class: usize) -> u32 {
    u32::try_from(class + 1).unwrap_or(u32::MAX)
}

impl DetectionDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.config.num_classes * self.config.samples_per_class
    }

    fn get(&self, index: usize) -> Result<DetectionSample> {
        if index >= self.len() {
            return Err(DatasetError::index_out_of_range(index, self.len()));
        }
        let objects = self.objects(index);
        let image = self.render(&objects);
        Ok(DetectionSample::new(
            image,
            Self::CHANNELS,
            self.config.image_size,
            self.config.image_size,
            objects,
        ))
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn labels_of(&self, index: usize) -> Result<Vec<u32>> {
        if index >= self.len() {
            return Err(DatasetError::index_out_of_range(index, self.len()));
        }
        Ok(self.objects(index).iter().map(|a| a.label).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_valid_and_deterministic() {
        let dataset = SyntheticDataset::new(SyntheticConfig::default().with_image_size(32));
        assert_eq!(dataset.len(), 100);
        let a = dataset.get(7).unwrap();
        let b = dataset.get(7).unwrap();
        assert!(a.is_valid());
        assert_eq!(a, b);
    }

    #[test]
    fn primary_object_carries_class_label() {
        let dataset = SyntheticDataset::new(SyntheticConfig::default().with_num_classes(4));
        for index in 0..dataset.len() {
            let sample = dataset.get(index).unwrap();
            assert_eq!(sample.annotations[0].label, label(index % 4));
            assert!(sample.annotations.iter().all(|a| a.bbox.is_normalized()));
        }
    }

    #[test]
    fn rendered_pixels_inside_box() {
        let dataset = SyntheticDataset::new(SyntheticConfig::default().with_num_classes(2));
        let sample = dataset.get(1).unwrap();
        let bbox = sample.annotations[0].bbox;
        let (cx, cy) = bbox.center();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (x, y) = ((cx * 64.0) as usize, (cy * 64.0) as usize);
        let value = sample.image_chw[y * 64 + x];
        assert!((value - SyntheticDataset::class_color(1, 0)).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_index() {
        let dataset = SyntheticDataset::new(SyntheticConfig::default().with_num_classes(2));
        assert!(dataset.get(10).is_err());
        assert!(dataset.labels_of(10).is_err());
    }
}
