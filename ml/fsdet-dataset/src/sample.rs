//! Detection sample types.

use fsdet_types::Annotation;
use serde::{Deserialize, Serialize};

/// A single training image with its ground-truth objects.
///
/// # Image Format
///
/// The image is stored as a flat `Vec<f32>` in CHW (Channel-Height-Width)
/// layout, already preprocessed (mean-subtracted and resized) so it can be
/// stacked into a batch tensor without further work.
///
/// # Example
///
/// ```
/// use fsdet_dataset::DetectionSample;
/// use fsdet_types::{Annotation, BoundingBox};
///
/// let sample = DetectionSample::new(
///     vec![0.5; 3 * 32 * 32],
///     3, 32, 32,
///     vec![Annotation::new(BoundingBox::new(0.1, 0.2, 0.3, 0.4), 1)],
/// );
///
/// assert_eq!(sample.num_objects(), 1);
/// assert!(sample.is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSample {
    /// Image data in CHW layout.
    pub image_chw: Vec<f32>,

    /// Channel count.
    pub channels: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Image width in pixels.
    pub width: u32,

    /// Ground-truth objects with 1-based labels.
    pub annotations: Vec<Annotation>,
}

impl DetectionSample {
    /// Creates a new detection sample.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(
        image_chw: Vec<f32>,
        channels: u32,
        height: u32,
        width: u32,
        annotations: Vec<Annotation>,
    ) -> Self {
        Self {
            image_chw,
            channels,
            height,
            width,
            annotations,
        }
    }

    /// Returns the number of annotated objects.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.annotations.len()
    }

    /// Returns the `(channels, height, width)` triple.
    #[must_use]
    pub const fn shape(&self) -> (u32, u32, u32) {
        (self.channels, self.height, self.width)
    }

    /// Returns the expected image data length (C * H * W).
    #[must_use]
    pub const fn expected_image_len(&self) -> usize {
        (self.channels as usize) * (self.height as usize) * (self.width as usize)
    }

    /// Returns `true` if any object carries `label`.
    #[must_use]
    pub fn contains_label(&self, label: u32) -> bool {
        self.annotations.iter().any(|a| a.label == label)
    }

    /// Validates the sample data.
    ///
    /// Returns `true` if dimensions are positive and the pixel buffer length
    /// matches them. Annotations are not checked here: malformed boxes are
    /// treated as background by the matcher.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.channels > 0
            && self.height > 0
            && self.width > 0
            && self.image_chw.len() == self.expected_image_len()
    }
}
