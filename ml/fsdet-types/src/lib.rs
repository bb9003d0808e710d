//! Detection value types for few-shot detector training.
//!
//! This crate provides the small, dependency-free types shared by every
//! other crate of the workspace:
//!
//! - [`BoundingBox`] - Normalized corner-form box with `IoU`
//! - [`Prior`] - Center-form anchor box
//! - [`Annotation`] - Ground-truth box with a 1-based class label
//!
//! # Layer 0 Crate
//!
//! No tensor library is involved here; everything is plain `f32` geometry so
//! the dataset and matching code can be tested without a backend.
//!
//! # Example
//!
//! ```
//! use fsdet_types::{Annotation, BoundingBox, Prior};
//!
//! let truth = Annotation::new(BoundingBox::new(0.4, 0.4, 0.6, 0.6), 1);
//! let prior = Prior::new(0.5, 0.5, 0.2, 0.2);
//!
//! let overlap = truth.bbox.iou(&prior.to_point_form());
//! assert!((overlap - 1.0).abs() < 1e-5);
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod bbox;
mod error;
mod label;
mod prior;

pub use bbox::BoundingBox;
pub use label::{Annotation, BACKGROUND};
pub use prior::Prior;

pub use error::{Result, TypesError};
