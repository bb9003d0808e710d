//! Prior-to-ground-truth matching and box encoding.
//!
//! Matching runs on the host: the inputs are a handful of boxes per image
//! against a fixed prior list, and the result feeds both the imprinting
//! engine (which priors are positives, and of which class) and the loss.

use fsdet_types::{Annotation, BACKGROUND, BoundingBox, Prior};
use tracing::debug;

/// Overlap written for force-matched priors; above any real IoU.
const FORCED_OVERLAP: f32 = 2.0;

/// Converts priors to corner form.
#[must_use]
pub fn point_form(priors: &[Prior]) -> Vec<BoundingBox> {
    priors.iter().map(Prior::to_point_form).collect()
}

/// Converts corner-form boxes to center form.
#[must_use]
pub fn center_size(boxes: &[BoundingBox]) -> Vec<Prior> {
    boxes
        .iter()
        .map(|b| {
            let [cx, cy, w, h] = b.to_center_form();
            Prior::new(cx, cy, w, h)
        })
        .collect()
}

/// Pairwise IoU, `result[a][b] = iou(boxes_a[a], boxes_b[b])`.
#[must_use]
pub fn jaccard(boxes_a: &[BoundingBox], boxes_b: &[BoundingBox]) -> Vec<Vec<f32>> {
    boxes_a
        .iter()
        .map(|a| boxes_b.iter().map(|b| a.iou(b)).collect())
        .collect()
}

/// Encodes a matched box as offsets relative to `prior`.
///
/// # Example
///
/// ```
/// use fsdet_training::encode;
/// use fsdet_types::{BoundingBox, Prior};
///
/// let prior = Prior::new(0.5, 0.5, 0.2, 0.2);
/// let offsets = encode(&BoundingBox::new(0.4, 0.4, 0.6, 0.6), &prior, [0.1, 0.2]);
/// assert!(offsets.iter().all(|v| v.abs() < 1e-5));
/// ```
#[must_use]
pub fn encode(matched: &BoundingBox, prior: &Prior, variance: [f32; 2]) -> [f32; 4] {
    let [cx, cy, w, h] = matched.to_center_form();
    [
        (cx - prior.cx) / (variance[0] * prior.w),
        (cy - prior.cy) / (variance[0] * prior.h),
        (w / prior.w).ln() / variance[1],
        (h / prior.h).ln() / variance[1],
    ]
}

/// Inverse of [`encode`].
#[must_use]
pub fn decode(offsets: [f32; 4], prior: &Prior, variance: [f32; 2]) -> BoundingBox {
    let cx = prior.cx + offsets[0] * variance[0] * prior.w;
    let cy = prior.cy + offsets[1] * variance[0] * prior.h;
    let w = prior.w * (offsets[2] * variance[1]).exp();
    let h = prior.h * (offsets[3] * variance[1]).exp();
    BoundingBox::from_center(cx, cy, w, h)
}

/// Per-prior regression, class and objectness targets for a batch.
///
/// Storage is allocated once per batch shape and overwritten per image.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetBatch {
    batch_size: usize,
    num_priors: usize,
    loc: Vec<f32>,
    conf: Vec<i64>,
    obj: Vec<bool>,
}

impl TargetBatch {
    /// Allocates all-background targets.
    #[must_use]
    pub fn new(batch_size: usize, num_priors: usize) -> Self {
        Self {
            batch_size,
            num_priors,
            loc: vec![0.0; batch_size * num_priors * 4],
            conf: vec![i64::from(BACKGROUND); batch_size * num_priors],
            obj: vec![false; batch_size * num_priors],
        }
    }

    /// Images in the batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Priors per image.
    #[must_use]
    pub const fn num_priors(&self) -> usize {
        self.num_priors
    }

    /// Regression targets of image `b`, four per prior.
    #[must_use]
    pub fn loc(&self, b: usize) -> &[f32] {
        let n = self.num_priors * 4;
        &self.loc[b * n..(b + 1) * n]
    }

    /// Class ids of image `b`; 0 is background.
    #[must_use]
    pub fn conf(&self, b: usize) -> &[i64] {
        &self.conf[b * self.num_priors..(b + 1) * self.num_priors]
    }

    /// Objectness of image `b`.
    #[must_use]
    pub fn obj(&self, b: usize) -> &[bool] {
        &self.obj[b * self.num_priors..(b + 1) * self.num_priors]
    }

    /// All regression targets, `[B * P * 4]`.
    #[must_use]
    pub fn loc_flat(&self) -> &[f32] {
        &self.loc
    }

    /// All class ids, `[B * P]`.
    #[must_use]
    pub fn conf_flat(&self) -> &[i64] {
        &self.conf
    }

    /// All objectness flags, `[B * P]`.
    #[must_use]
    pub fn obj_flat(&self) -> &[bool] {
        &self.obj
    }

    /// Matched priors in image `b`.
    #[must_use]
    pub fn positives(&self, b: usize) -> usize {
        self.obj(b).iter().filter(|&&o| o).count()
    }

    /// Matched priors in the batch.
    #[must_use]
    pub fn num_positives(&self) -> usize {
        self.obj.iter().filter(|&&o| o).count()
    }

    /// Copies images `start..start + len`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the batch.
    #[must_use]
    pub fn slice(&self, start: usize, len: usize) -> Self {
        let p = self.num_priors;
        Self {
            batch_size: len,
            num_priors: p,
            loc: self.loc[start * p * 4..(start + len) * p * 4].to_vec(),
            conf: self.conf[start * p..(start + len) * p].to_vec(),
            obj: self.obj[start * p..(start + len) * p].to_vec(),
        }
    }

    /// Reshapes for `batch_size` images, reusing the storage when it fits.
    pub fn ensure_batch(&mut self, batch_size: usize) {
        if batch_size != self.batch_size {
            *self = Self::new(batch_size, self.num_priors);
        }
    }

    fn clear(&mut self, b: usize) {
        let p = self.num_priors;
        self.loc[b * p * 4..(b + 1) * p * 4].fill(0.0);
        self.conf[b * p..(b + 1) * p].fill(i64::from(BACKGROUND));
        self.obj[b * p..(b + 1) * p].fill(false);
    }

    /// Matches every image of a batch.
    pub fn match_batch(
        &mut self,
        threshold: f32,
        annotations: &[Vec<Annotation>],
        priors: &[Prior],
        variance: [f32; 2],
    ) {
        self.ensure_batch(annotations.len());
        for (b, objects) in annotations.iter().enumerate() {
            let truths: Vec<BoundingBox> = objects.iter().map(|a| a.bbox).collect();
            let labels: Vec<u32> = objects.iter().map(|a| a.label).collect();
            match_priors(threshold, &truths, priors, variance, &labels, self, b);
        }
    }
}

/// Matches one image's ground truth against the priors.
///
/// Writes image `batch_index` of `targets`. Every truth claims its best
/// prior unconditionally (later truths win when two share one); every other
/// prior takes its best truth if the overlap reaches `threshold`. An image
/// with no boxes, a degenerate box, a background label or mismatched
/// `truths`/`labels` lengths gets all-background targets.
#[allow(clippy::too_many_arguments)]
pub fn match_priors(
    threshold: f32,
    truths: &[BoundingBox],
    priors: &[Prior],
    variance: [f32; 2],
    labels: &[u32],
    targets: &mut TargetBatch,
    batch_index: usize,
) {
    targets.clear(batch_index);
    if truths.is_empty() || priors.is_empty() {
        return;
    }
    let malformed = truths.len() != labels.len()
        || truths.iter().any(|t| !t.is_well_formed())
        || labels.contains(&BACKGROUND);
    if malformed {
        debug!(
            image = batch_index,
            truths = truths.len(),
            "Malformed ground truth; treating image as background"
        );
        return;
    }

    let overlaps = jaccard(truths, &point_form(priors));

    let best_prior: Vec<usize> = overlaps
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (p, &o)| {
                    if o > best.1 { (p, o) } else { best }
                })
                .0
        })
        .collect();

    let mut best_truth = vec![0usize; priors.len()];
    let mut best_overlap = vec![f32::NEG_INFINITY; priors.len()];
    for (t, row) in overlaps.iter().enumerate() {
        for (p, &o) in row.iter().enumerate() {
            if o > best_overlap[p] {
                best_overlap[p] = o;
                best_truth[p] = t;
            }
        }
    }

    for &p in &best_prior {
        best_overlap[p] = FORCED_OVERLAP;
    }
    for (t, &p) in best_prior.iter().enumerate() {
        best_truth[p] = t;
    }

    let offset = batch_index * targets.num_priors;
    for (p, prior) in priors.iter().enumerate() {
        if best_overlap[p] < threshold {
            continue;
        }
        let t = best_truth[p];
        let i = offset + p;
        targets.conf[i] = i64::from(labels[t]);
        targets.obj[i] = true;
        targets.loc[i * 4..i * 4 + 4].copy_from_slice(&encode(&truths[t], prior, variance));
    }
}
