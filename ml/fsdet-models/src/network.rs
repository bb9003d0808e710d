//! Network contract used by imprinting and fine-tuning.

use burn::optim::GradientsParams;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;

use crate::denselayer::{DenseLayer, Stage};
use crate::error::Result;

/// Per-prior predictions aligned with the prior sequence.
#[derive(Debug, Clone)]
pub struct DetectionOutput<B: Backend> {
    /// Box offsets `[N, P, 4]`.
    pub loc: Tensor<B, 3>,
    /// Scaled class scores `[N, P, n_way]`.
    pub conf: Tensor<B, 3>,
    /// Objectness logits `[N, P, 2]` (background, object).
    pub obj: Tensor<B, 3>,
}

/// A detector whose classification head is a cascade of imprintable stages.
///
/// Besides the ordinary forward pass the contract exposes the pre-classifier
/// embedding at every prior and the three [`DenseLayer`]s, which is all the
/// imprinting engine needs to synthesize class weights.
pub trait DetectionNetwork<B: Backend> {
    /// Runs the full forward pass on `[N, C, H, W]` images.
    fn forward(&self, images: Tensor<B, 4>) -> DetectionOutput<B>;

    /// Returns raw per-prior embeddings `[N, P, feature_dim]`.
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 3>;

    /// Borrows a stage.
    fn dense_layer(&self, stage: Stage) -> &DenseLayer<B>;

    /// Mutably borrows a stage.
    fn dense_layer_mut(&mut self, stage: Stage) -> &mut DenseLayer<B>;

    /// Number of classes scored.
    fn n_way(&self) -> usize;

    /// Embedding width.
    fn feature_dim(&self) -> usize;

    /// Number of priors per image.
    fn num_priors(&self) -> usize;

    /// Class matrix of `stage`.
    fn classifier_weights(&self, stage: Stage) -> Tensor<B, 2> {
        self.dense_layer(stage).weights()
    }

    /// Overwrites the class matrix of `stage`.
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch if `weights` is not `[n_way, width(stage)]`.
    fn set_classifier_weights(&mut self, stage: Stage, weights: Tensor<B, 2>) -> Result<()> {
        self.dense_layer_mut(stage).set_weights(weights)
    }

    /// Projects every class row of every stage to unit L2 norm.
    fn normalize(&mut self) {
        for stage in Stage::ALL {
            self.dense_layer_mut(stage).normalize();
        }
    }

    /// Forces the batch-norm scale of every stage to one.
    fn reset_stage_scales(&mut self) {
        for stage in Stage::ALL {
            self.dense_layer_mut(stage).norm_mut().reset_scale();
        }
    }
}

/// Gradients of one learning-rate group.
#[derive(Debug)]
pub struct GradientGroup {
    /// Group name for logging.
    pub name: &'static str,
    /// Multiplier applied to the base learning rate.
    pub lr_factor: f64,
    /// Gradients of the group's parameters.
    pub grads: GradientsParams,
}

/// Splits raw gradients into learning-rate groups.
pub trait GradientGroups<B: AutodiffBackend> {
    /// Removes this module's gradients from `grads`, grouped.
    ///
    /// Every parameter lands in exactly one group.
    fn gradient_groups(&self, grads: &mut B::Gradients) -> Vec<GradientGroup>;
}
