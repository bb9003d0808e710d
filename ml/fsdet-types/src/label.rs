//! Ground-truth annotations.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::error::{Result, TypesError};

/// Class id reserved for background / "no object".
pub const BACKGROUND: u32 = 0;

/// A ground-truth object: a box and its class label.
///
/// Labels are 1-based: `1..=n_way` name foreground classes and
/// [`BACKGROUND`] (0) is never a valid annotation label.
///
/// # Example
///
/// ```
/// use fsdet_types::{Annotation, BoundingBox};
///
/// let ann = Annotation::new(BoundingBox::new(0.1, 0.1, 0.4, 0.5), 3);
/// assert!(ann.is_foreground());
/// assert_eq!(ann.class_slot(), Some(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Object box in point form.
    pub bbox: BoundingBox,
    /// Class label in `1..=n_way`.
    pub label: u32,
}

impl Annotation {
    /// Creates a new annotation.
    #[must_use]
    pub const fn new(bbox: BoundingBox, label: u32) -> Self {
        Self { bbox, label }
    }

    /// Creates an annotation after checking the box and label range.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidBoundingBox`] for a non-finite or
    /// inverted box and [`TypesError::InvalidLabel`] for a label outside
    /// `1..=n_way`.
    pub fn checked(bbox: BoundingBox, label: u32, n_way: u32) -> Result<Self> {
        if !bbox.is_well_formed() {
            return Err(TypesError::invalid_bounding_box(format!("{bbox:?}")));
        }
        if label == BACKGROUND || label > n_way {
            return Err(TypesError::InvalidLabel { label, n_way });
        }
        Ok(Self { bbox, label })
    }

    /// Returns `true` if the label names a foreground class.
    #[must_use]
    pub const fn is_foreground(&self) -> bool {
        self.label != BACKGROUND
    }

    /// Returns the 0-based class slot (`label - 1`), or `None` for background.
    #[must_use]
    pub const fn class_slot(&self) -> Option<usize> {
        if self.label == BACKGROUND {
            None
        } else {
            Some((self.label - 1) as usize)
        }
    }

    /// Returns `true` if the annotation can take part in prior matching.
    #[must_use]
    pub fn is_matchable(&self) -> bool {
        self.is_foreground() && self.bbox.is_well_formed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn checked_accepts_valid() {
        let ann = Annotation::checked(BoundingBox::new(0.1, 0.1, 0.2, 0.2), 1, 20).unwrap();
        assert_eq!(ann.label, 1);
        assert_eq!(ann.class_slot(), Some(0));
    }

    #[test]
    fn checked_rejects_background_and_out_of_range() {
        let bbox = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        assert!(matches!(
            Annotation::checked(bbox, 0, 20),
            Err(TypesError::InvalidLabel { label: 0, .. })
        ));
        assert!(matches!(
            Annotation::checked(bbox, 21, 20),
            Err(TypesError::InvalidLabel { label: 21, .. })
        ));
    }

    #[test]
    fn checked_rejects_inverted_box() {
        let bbox = BoundingBox::new(0.5, 0.1, 0.2, 0.2);
        assert!(matches!(
            Annotation::checked(bbox, 1, 20),
            Err(TypesError::InvalidBoundingBox(_))
        ));
    }

    #[test]
    fn matchable() {
        let good = Annotation::new(BoundingBox::new(0.1, 0.1, 0.2, 0.2), 2);
        let background = Annotation::new(BoundingBox::new(0.1, 0.1, 0.2, 0.2), BACKGROUND);
        let flat = Annotation::new(BoundingBox::new(0.1, 0.1, 0.1, 0.2), 2);
        assert!(good.is_matchable());
        assert!(!background.is_matchable());
        assert!(!flat.is_matchable());
        assert_eq!(background.class_slot(), None);
    }
}
