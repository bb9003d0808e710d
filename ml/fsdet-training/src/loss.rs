//! Multibox loss with hard negative mining.

use std::ops::{Add, AddAssign};

use burn::prelude::Backend;
use burn::tensor::activation::log_softmax;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use fsdet_models::DetectionOutput;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};
use crate::matching::TargetBatch;

/// Element-wise smooth L1 (Huber) loss.
///
/// - For |x| < beta: 0.5 * x^2 / beta
/// - For |x| >= beta: |x| - 0.5 * beta
pub fn smooth_l1<B: Backend, const D: usize>(diff: Tensor<B, D>, beta: f32) -> Tensor<B, D> {
    let abs_diff = diff.clone().abs();

    let quadratic = diff.powf_scalar(2.0) / (2.0 * beta);
    let linear = abs_diff.clone() - (beta / 2.0);

    let mask = abs_diff.lower_elem(beta);
    mask.clone().float() * quadratic + mask.bool_not().float() * linear
}

/// Host-side loss values.
///
/// # Example
///
/// ```
/// use fsdet_training::LossValues;
///
/// let mut epoch = LossValues::default();
/// epoch += LossValues::new(1.0, 2.0, 3.0);
/// epoch += LossValues::new(1.0, 0.0, 1.0);
/// assert!((epoch.averaged(2).obj - 2.0).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossValues {
    /// Box regression.
    pub loc: f32,
    /// Class cross-entropy.
    pub conf: f32,
    /// Objectness cross-entropy.
    pub obj: f32,
}

impl LossValues {
    /// Creates loss values.
    #[must_use]
    pub const fn new(loc: f32, conf: f32, obj: f32) -> Self {
        Self { loc, conf, obj }
    }

    /// Sum of the components.
    #[must_use]
    pub fn total(&self) -> f32 {
        self.loc + self.conf + self.obj
    }

    /// Returns `true` if every component is finite.
    #[must_use]
    pub const fn is_finite(&self) -> bool {
        self.loc.is_finite() && self.conf.is_finite() && self.obj.is_finite()
    }

    /// Divides every component by `count` (no-op for zero).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn averaged(&self, count: usize) -> Self {
        if count == 0 {
            return *self;
        }
        let n = count as f32;
        Self::new(self.loc / n, self.conf / n, self.obj / n)
    }
}

impl Add for LossValues {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.loc + rhs.loc, self.conf + rhs.conf, self.obj + rhs.obj)
    }
}

impl AddAssign for LossValues {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Loss tensors of one forward pass.
#[derive(Debug, Clone)]
pub struct LossComponents<B: Backend> {
    /// Box regression over positives.
    pub loc: Tensor<B, 1>,
    /// Class cross-entropy over positives.
    pub conf: Tensor<B, 1>,
    /// Objectness cross-entropy over positives and mined negatives.
    pub obj: Tensor<B, 1>,
}

impl<B: Backend> LossComponents<B> {
    /// `loc + conf + obj`.
    #[must_use]
    pub fn total(&self) -> Tensor<B, 1> {
        self.loc.clone() + self.conf.clone() + self.obj.clone()
    }

    /// Reads the components back to the host.
    #[must_use]
    pub fn values(&self) -> LossValues {
        LossValues::new(
            self.loc.clone().into_scalar().elem(),
            self.conf.clone().into_scalar().elem(),
            self.obj.clone().into_scalar().elem(),
        )
    }
}

/// Combined regression, class and objectness loss.
///
/// All three terms are normalized by the number of positive priors in the
/// batch (at least one). Objectness additionally trains on the
/// `negpos_ratio × positives` highest-loss background priors of each image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiBoxLoss {
    /// Hard negatives kept per positive.
    pub negpos_ratio: usize,
}

impl Default for MultiBoxLoss {
    fn default() -> Self {
        Self::new(3)
    }
}

impl MultiBoxLoss {
    /// Creates the loss.
    #[must_use]
    pub const fn new(negpos_ratio: usize) -> Self {
        Self { negpos_ratio }
    }

    /// Computes the loss of `output` against `targets`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Loss`] if the output and target shapes
    /// disagree or the objectness scores cannot be read back for mining.
    pub fn forward<B: Backend>(
        &self,
        output: &DetectionOutput<B>,
        targets: &TargetBatch,
    ) -> Result<LossComponents<B>> {
        self.forward_normalized(output, targets, targets.num_positives())
    }

    /// Computes the loss with every term divided by `num_positives`
    /// (at least one) instead of the positives in `targets`.
    ///
    /// Summing the losses of contiguous batch shards, each normalized by the
    /// positives of the whole batch, gives the loss of the whole batch.
    ///
    /// # Errors
    ///
    /// Same as [`MultiBoxLoss::forward`].
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    pub fn forward_normalized<B: Backend>(
        &self,
        output: &DetectionOutput<B>,
        targets: &TargetBatch,
        num_positives: usize,
    ) -> Result<LossComponents<B>> {
        let [n, p, _] = output.loc.dims();
        let n_way = output.conf.dims()[2];
        if n != targets.batch_size() || p != targets.num_priors() || n_way == 0 {
            return Err(TrainingError::loss(format!(
                "output [{n}, {p}, {n_way}] does not match targets [{}, {}]",
                targets.batch_size(),
                targets.num_priors()
            )));
        }
        let device = output.loc.device();
        let num_pos = num_positives.max(1) as f32;

        let positive: Vec<f32> = targets
            .obj_flat()
            .iter()
            .map(|&o| if o { 1.0 } else { 0.0 })
            .collect();
        let pos = Tensor::<B, 2>::from_data(TensorData::new(positive, [n, p]), &device);

        let loc_t =
            Tensor::<B, 3>::from_data(TensorData::new(targets.loc_flat().to_vec(), [n, p, 4]), &device);
        let loc = smooth_l1(output.loc.clone() - loc_t, 1.0)
            .sum_dim(2)
            .reshape([n, p])
            .mul(pos.clone())
            .sum()
            .div_scalar(num_pos);

        let max_class = n_way as i64 - 1;
        let classes: Vec<i64> = targets
            .conf_flat()
            .iter()
            .map(|&c| (c - 1).clamp(0, max_class))
            .collect();
        let class_idx =
            Tensor::<B, 3, Int>::from_data(TensorData::new(classes, [n, p, 1]), &device);
        let conf = log_softmax(output.conf.clone(), 2)
            .gather(2, class_idx)
            .reshape([n, p])
            .neg()
            .mul(pos)
            .sum()
            .div_scalar(num_pos);

        let obj_log = log_softmax(output.obj.clone(), 2);
        let background: Vec<f32> = obj_log
            .clone()
            .detach()
            .slice([0..n, 0..p, 0..1])
            .neg()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TrainingError::loss(format!("objectness readback: {e:?}")))?;
        let selected = self.mine(targets, &background);
        let mask = Tensor::<B, 2>::from_data(TensorData::new(selected, [n, p]), &device);
        let obj_targets: Vec<i64> = targets.obj_flat().iter().map(|&o| i64::from(o)).collect();
        let obj_idx =
            Tensor::<B, 3, Int>::from_data(TensorData::new(obj_targets, [n, p, 1]), &device);
        let obj = obj_log
            .gather(2, obj_idx)
            .reshape([n, p])
            .neg()
            .mul(mask)
            .sum()
            .div_scalar(num_pos);

        Ok(LossComponents { loc, conf, obj })
    }

    /// Marks positives and the hardest background priors of each image.
    fn mine(&self, targets: &TargetBatch, background: &[f32]) -> Vec<f32> {
        let p = targets.num_priors();
        let mut selected = vec![0.0; targets.batch_size() * p];
        for b in 0..targets.batch_size() {
            let obj = targets.obj(b);
            let losses = &background[b * p..(b + 1) * p];
            let num_neg = (self.negpos_ratio * targets.positives(b)).min(p.saturating_sub(1));

            let mut negatives: Vec<usize> = (0..p).filter(|&i| !obj[i]).collect();
            negatives.sort_by(|&a, &c| losses[c].total_cmp(&losses[a]));

            let row = &mut selected[b * p..(b + 1) * p];
            for (i, &o) in obj.iter().enumerate() {
                if o {
                    row[i] = 1.0;
                }
            }
            for &i in negatives.iter().take(num_neg) {
                row[i] = 1.0;
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use fsdet_types::{BoundingBox, Prior};

    use crate::matching::match_priors;

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    fn strip(priors: usize) -> Vec<Prior> {
        #[allow(clippy::cast_precision_loss)]
        let step = 1.0 / priors as f32;
        (0..priors)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let cx = (i as f32 + 0.5) * step;
                Prior::new(cx, 0.5, step, 1.0)
            })
            .collect()
    }

    fn one_positive(priors: usize) -> TargetBatch {
        let mut targets = TargetBatch::new(1, priors);
        let strip = strip(priors);
        let first = strip[0].to_point_form();
        match_priors(0.5, &[first], &strip, [0.1, 0.2], &[2], &mut targets, 0);
        targets
    }

    fn output<B: Backend>(n: usize, p: usize, n_way: usize, device: &B::Device) -> DetectionOutput<B> {
        DetectionOutput {
            loc: Tensor::zeros([n, p, 4], device),
            conf: Tensor::zeros([n, p, n_way], device),
            obj: Tensor::zeros([n, p, 2], device),
        }
    }

    #[test]
    fn smooth_l1_branches() {
        let device = Default::default();
        let diff = Tensor::<TestBackend, 1>::from_data([0.5, -2.0], &device);
        let values = smooth_l1(diff, 1.0).into_data().to_vec::<f32>().unwrap_or_default();
        assert_relative_eq!(values[0], 0.125);
        assert_relative_eq!(values[1], 1.5);
    }

    #[test]
    fn uniform_logits_give_known_loss() {
        let device = Default::default();
        let targets = one_positive(8);
        assert_eq!(targets.num_positives(), 1);

        let loss = MultiBoxLoss::new(3)
            .forward(&output::<TestBackend>(1, 8, 4, &device), &targets)
            .unwrap_or_else(|e| panic!("{e}"))
            .values();
        assert_relative_eq!(loss.loc, 0.0, epsilon = 1e-6);
        assert_relative_eq!(loss.conf, 4f32.ln(), epsilon = 1e-5);
        // one positive plus three mined negatives, each ln 2
        assert_relative_eq!(loss.obj, 4.0 * 2f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn mining_prefers_confident_false_positives() {
        let targets = one_positive(6);
        let mut background = vec![0.1; 6];
        background[3] = 5.0;
        background[5] = 4.0;
        let selected = MultiBoxLoss::new(2).mine(&targets, &background);
        assert_eq!(selected, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn explicit_normalizer_scales_every_term() {
        let device = Default::default();
        let targets = one_positive(8);
        let criterion = MultiBoxLoss::new(3);
        let output = output::<TestBackend>(1, 8, 4, &device);

        let own = criterion.forward(&output, &targets).unwrap_or_else(|e| panic!("{e}")).values();
        let shared = criterion
            .forward_normalized(&output, &targets, 4)
            .unwrap_or_else(|e| panic!("{e}"))
            .values();
        assert_relative_eq!(shared.conf, own.conf / 4.0, epsilon = 1e-6);
        assert_relative_eq!(shared.obj, own.obj / 4.0, epsilon = 1e-6);

        let clamped = criterion
            .forward_normalized(&output, &targets, 0)
            .unwrap_or_else(|e| panic!("{e}"))
            .values();
        assert_eq!(clamped, own);
    }

    #[test]
    fn no_positives_gives_zero_loss() {
        let device = Default::default();
        let targets = TargetBatch::new(2, 5);
        let loss = MultiBoxLoss::default()
            .forward(&output::<TestBackend>(2, 5, 3, &device), &targets)
            .unwrap_or_else(|e| panic!("{e}"))
            .values();
        assert_eq!(loss, LossValues::default());
    }

    #[test]
    fn confident_correct_output_has_small_loss() {
        let device = Default::default();
        let targets = one_positive(4);
        let conf = Tensor::<TestBackend, 3>::from_data(
            [[
                [-10.0, 10.0, -10.0],
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
            ]],
            &device,
        );
        let obj = Tensor::<TestBackend, 3>::from_data(
            [[[-10.0, 10.0], [10.0, -10.0], [10.0, -10.0], [10.0, -10.0]]],
            &device,
        );
        let out = DetectionOutput {
            loc: Tensor::zeros([1, 4, 4], &device),
            conf,
            obj,
        };
        let loss = MultiBoxLoss::default()
            .forward(&out, &targets)
            .unwrap_or_else(|e| panic!("{e}"))
            .values();
        assert!(loss.total() < 1e-3, "{loss:?}");
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let device = Default::default();
        let targets = TargetBatch::new(1, 4);
        let result = MultiBoxLoss::default().forward(&output::<TestBackend>(1, 5, 2, &device), &targets);
        assert!(matches!(result, Err(TrainingError::Loss(_))));
    }

    #[test]
    fn loss_backpropagates() {
        let device = Default::default();
        let targets = one_positive(4);
        let conf = Tensor::<TestAutodiff, 3>::zeros([1, 4, 3], &device).require_grad();
        let out = DetectionOutput {
            loc: Tensor::zeros([1, 4, 4], &device),
            conf: conf.clone(),
            obj: Tensor::zeros([1, 4, 2], &device),
        };
        let loss = MultiBoxLoss::default()
            .forward(&out, &targets)
            .unwrap_or_else(|e| panic!("{e}"));
        let grads = loss.total().backward();
        let grad = conf.grad(&grads).map(|g| g.into_data().to_vec::<f32>().unwrap_or_default());
        let grad = grad.unwrap_or_default();
        // only the positive prior receives class gradient
        assert!(grad[..3].iter().any(|g| g.abs() > 1e-6));
        assert!(grad[3..].iter().all(|g| g.abs() < 1e-9));
    }

    #[test]
    fn loss_values_accumulate() {
        let mut total = LossValues::default();
        total += LossValues::new(1.0, 2.0, 3.0);
        total += LossValues::new(3.0, 2.0, 1.0);
        assert_relative_eq!(total.total(), 12.0);
        assert_eq!(total.averaged(2), LossValues::new(2.0, 2.0, 2.0));
        assert!(!LossValues::new(f32::NAN, 0.0, 0.0).is_finite());
    }

    #[test]
    fn loss_values_serialization() {
        let values = LossValues::new(0.5, 1.5, 2.5);
        let json = serde_json::to_string(&values).unwrap_or_default();
        let parsed: LossValues = serde_json::from_str(&json).unwrap_or_default();
        assert_eq!(parsed, values);
    }

    #[test]
    fn strip_priors_are_disjoint() {
        let boxes: Vec<BoundingBox> = strip(4).iter().map(Prior::to_point_form).collect();
        assert_relative_eq!(boxes[0].iou(&boxes[1]), 0.0);
    }
}
