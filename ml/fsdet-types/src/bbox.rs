//! Corner-form bounding boxes.

use serde::{Deserialize, Serialize};

/// A normalized axis-aligned bounding box.
///
/// Coordinates are normalized to `[0, 1]` relative to image dimensions.
/// Format is `[x0, y0, x1, y1]` (top-left to bottom-right), the "point form"
/// used by ground-truth annotations and by the prior matcher.
///
/// # Example
///
/// ```
/// use fsdet_types::BoundingBox;
///
/// let bbox = BoundingBox::new(0.1, 0.2, 0.5, 0.6);
///
/// assert!((bbox.width() - 0.4).abs() < 1e-6);
/// assert!((bbox.height() - 0.4).abs() < 1e-6);
/// assert!((bbox.area() - 0.16).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    /// Left edge (x0), normalized to `[0, 1]`.
    pub x0: f32,
    /// Top edge (y0), normalized to `[0, 1]`.
    pub y0: f32,
    /// Right edge (x1), normalized to `[0, 1]`.
    pub x1: f32,
    /// Bottom edge (y1), normalized to `[0, 1]`.
    pub y1: f32,
}

impl BoundingBox {
    /// Creates a new bounding box from its corners.
    #[must_use]
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Creates a bounding box from an array `[x0, y0, x1, y1]`.
    #[must_use]
    pub const fn from_array(coords: [f32; 4]) -> Self {
        Self {
            x0: coords[0],
            y0: coords[1],
            x1: coords[2],
            y1: coords[3],
        }
    }

    /// Creates a bounding box from center form `(cx, cy, w, h)`.
    #[must_use]
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x0: cx - w / 2.0,
            y0: cy - h / 2.0,
            x1: cx + w / 2.0,
            y1: cy + h / 2.0,
        }
    }

    /// Returns the box as an array `[x0, y0, x1, y1]`.
    #[must_use]
    pub const fn as_array(&self) -> [f32; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }

    /// Returns the box width (normalized).
    #[must_use]
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    /// Returns the box height (normalized).
    #[must_use]
    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    /// Returns the box area (normalized).
    #[must_use]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Returns the center point `(cx, cy)`.
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (
            f32::midpoint(self.x0, self.x1),
            f32::midpoint(self.y0, self.y1),
        )
    }

    /// Returns the box in center form `[cx, cy, w, h]`.
    #[must_use]
    pub fn to_center_form(&self) -> [f32; 4] {
        let (cx, cy) = self.center();
        [cx, cy, self.x1 - self.x0, self.y1 - self.y0]
    }

    /// Checks if the box coordinates are finite and ordered.
    ///
    /// Unlike [`BoundingBox::is_normalized`], this accepts boxes that extend
    /// past the image border (augmentation can produce them).
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.x0.is_finite()
            && self.y0.is_finite()
            && self.x1.is_finite()
            && self.y1.is_finite()
            && self.x0 < self.x1
            && self.y0 < self.y1
    }

    /// Checks if the box lies in `[0, 1]` with `x0 <= x1`, `y0 <= y1`.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x0)
            && (0.0..=1.0).contains(&self.y0)
            && (0.0..=1.0).contains(&self.x1)
            && (0.0..=1.0).contains(&self.y1)
            && self.x0 <= self.x1
            && self.y0 <= self.y1
    }

    /// Computes the intersection-over-union (Jaccard overlap) with another box.
    ///
    /// Returns a value in `[0, 1]` where 1 means perfect overlap.
    #[must_use]
    #[allow(clippy::similar_names)]
    pub fn iou(&self, other: &Self) -> f32 {
        let inter_x0 = self.x0.max(other.x0);
        let inter_y0 = self.y0.max(other.y0);
        let inter_x1 = self.x1.min(other.x1);
        let inter_y1 = self.y1.min(other.y1);

        let inter_w = (inter_x1 - inter_x0).max(0.0);
        let inter_h = (inter_y1 - inter_y0).max(0.0);
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clamps coordinates to the valid range `[0, 1]`.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            x0: self.x0.clamp(0.0, 1.0),
            y0: self.y0.clamp(0.0, 1.0),
            x1: self.x1.clamp(0.0, 1.0),
            y1: self.y1.clamp(0.0, 1.0),
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(coords: [f32; 4]) -> Self {
        Self::from_array(coords)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bbox_dimensions() {
        let bbox = BoundingBox::new(0.1, 0.2, 0.5, 0.6);
        assert_relative_eq!(bbox.width(), 0.4, epsilon = 1e-6);
        assert_relative_eq!(bbox.height(), 0.4, epsilon = 1e-6);
        assert_relative_eq!(bbox.area(), 0.16, epsilon = 1e-6);
    }

    #[test]
    fn bbox_center_form_round_trip() {
        let bbox = BoundingBox::new(0.2, 0.1, 0.6, 0.5);
        let [cx, cy, w, h] = bbox.to_center_form();
        assert_relative_eq!(cx, 0.4, epsilon = 1e-6);
        assert_relative_eq!(cy, 0.3, epsilon = 1e-6);

        let restored = BoundingBox::from_center(cx, cy, w, h);
        assert_relative_eq!(restored.x0, bbox.x0, epsilon = 1e-6);
        assert_relative_eq!(restored.y1, bbox.y1, epsilon = 1e-6);
    }

    #[test]
    fn bbox_well_formed() {
        assert!(BoundingBox::new(0.1, 0.2, 0.5, 0.6).is_well_formed());
        assert!(BoundingBox::new(-0.1, 0.2, 1.2, 0.6).is_well_formed());
        assert!(!BoundingBox::new(0.5, 0.2, 0.5, 0.6).is_well_formed());
        assert!(!BoundingBox::new(f32::NAN, 0.0, 0.5, 0.5).is_well_formed());
    }

    #[test]
    fn bbox_normalized() {
        assert!(BoundingBox::new(0.1, 0.2, 0.5, 0.6).is_normalized());
        assert!(!BoundingBox::new(-0.1, 0.0, 0.5, 1.5).is_normalized());
        assert!(!BoundingBox::new(0.5, 0.6, 0.1, 0.2).is_normalized());
    }

    #[test]
    fn bbox_iou() {
        let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5);
        let b = BoundingBox::new(0.25, 0.25, 0.75, 0.75);

        // 0.0625 / 0.4375
        assert_relative_eq!(a.iou(&b), 0.0625 / 0.4375, epsilon = 1e-6);
        assert_relative_eq!(a.iou(&a), 1.0, epsilon = 1e-6);

        let c = BoundingBox::new(0.6, 0.6, 0.8, 0.8);
        assert!(a.iou(&c).abs() < 1e-6);
    }

    #[test]
    fn bbox_iou_degenerate_is_zero() {
        let point = BoundingBox::new(0.3, 0.3, 0.3, 0.3);
        assert_eq!(point.iou(&point), 0.0);
    }

    #[test]
    fn bbox_clamped() {
        let clamped = BoundingBox::new(-0.1, -0.2, 1.5, 1.3).clamped();
        assert_eq!(clamped.as_array(), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn bbox_serialization() {
        let bbox = BoundingBox::new(0.1, 0.2, 0.3, 0.4);
        let json = serde_json::to_string(&bbox).unwrap();
        let parsed: BoundingBox = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, bbox);
    }
}
