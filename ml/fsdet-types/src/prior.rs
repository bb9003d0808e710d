//! Prior (anchor) boxes.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;

/// A prior box in center form, normalized to image size.
///
/// # Example
///
/// ```
/// use fsdet_types::Prior;
///
/// let prior = Prior::new(0.5, 0.5, 0.2, 0.4);
/// let corners = prior.to_point_form();
/// assert!((corners.x0 - 0.4).abs() < 1e-6);
/// assert!((corners.y1 - 0.7).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Prior {
    /// Center x.
    pub cx: f32,
    /// Center y.
    pub cy: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
}

impl Prior {
    /// Creates a prior from center form.
    #[must_use]
    pub const fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    /// Returns the prior as `[cx, cy, w, h]`.
    #[must_use]
    pub const fn as_array(&self) -> [f32; 4] {
        [self.cx, self.cy, self.w, self.h]
    }

    /// Converts to corner form for overlap computations.
    #[must_use]
    pub fn to_point_form(&self) -> BoundingBox {
        BoundingBox::from_center(self.cx, self.cy, self.w, self.h)
    }

    /// Clamps every coordinate to `[0, 1]`.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            cx: self.cx.clamp(0.0, 1.0),
            cy: self.cy.clamp(0.0, 1.0),
            w: self.w.clamp(0.0, 1.0),
            h: self.h.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn point_form() {
        let b = Prior::new(0.25, 0.75, 0.5, 0.5).to_point_form();
        assert_relative_eq!(b.x0, 0.0);
        assert_relative_eq!(b.y0, 0.5);
        assert_relative_eq!(b.x1, 0.5);
        assert_relative_eq!(b.y1, 1.0);
    }

    #[test]
    fn clamped() {
        let p = Prior::new(0.5, 0.5, 1.3, -0.1).clamped();
        assert_relative_eq!(p.w, 1.0);
        assert_relative_eq!(p.h, 0.0);
    }
}
