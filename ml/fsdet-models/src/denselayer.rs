//! Cascaded cosine classifier stages.
//!
//! Stage `s` sees the raw prior embedding concatenated with the class scores
//! of every earlier stage, so its input width is
//! `feature_dim + (s - 1) * n_way`. Each stage normalizes that input
//! (batch-norm, then row L2 normalization) and projects it onto `n_way`
//! unit-norm class rows; with both sides on the unit sphere the projection is
//! a cosine similarity.

use std::fmt;

use burn::module::{Module, Param, RunningState};
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Smallest row norm used when normalizing.
pub const NORM_EPSILON: f32 = 1e-12;

/// One of the three classifier stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// `denselayer1`.
    First,
    /// `denselayer2`.
    Second,
    /// `denselayer3`.
    Third,
}

impl Stage {
    /// All stages in cascade order.
    pub const ALL: [Self; 3] = [Self::First, Self::Second, Self::Third];

    /// 1-based stage number.
    #[must_use]
    pub const fn number(self) -> usize {
        match self {
            Self::First => 1,
            Self::Second => 2,
            Self::Third => 3,
        }
    }

    /// Stages feeding this one, in order.
    #[must_use]
    pub fn predecessors(self) -> &'static [Self] {
        &Self::ALL[..self.number() - 1]
    }

    /// Input width of this stage.
    #[must_use]
    pub const fn input_width(self, feature_dim: usize, n_way: usize) -> usize {
        feature_dim + (self.number() - 1) * n_way
    }
}

impl TryFrom<usize> for Stage {
    type Error = ModelError;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            1 => Ok(Self::First),
            2 => Ok(Self::Second),
            3 => Ok(Self::Third),
            other => Err(ModelError::InvalidStage(other)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "denselayer{}", self.number())
    }
}

/// Divides every row by its L2 norm.
#[must_use]
pub fn l2_normalize_rows<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(NORM_EPSILON);
    x.div(norm)
}

/// Batch normalization over the feature axis of `[rows, width]` inputs.
///
/// Uses batch statistics (and updates the running ones) when the backend
/// tracks gradients, and the running statistics otherwise.
#[derive(Module, Debug)]
pub struct StageNorm<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    epsilon: f64,
    momentum: f64,
}

impl<B: Backend> StageNorm<B> {
    /// Creates a norm with unit scale, zero shift and identity statistics.
    #[must_use]
    pub fn new(width: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([width], device)),
            beta: Param::from_tensor(Tensor::zeros([width], device)),
            running_mean: RunningState::new(Tensor::zeros([width], device)),
            running_var: RunningState::new(Tensor::ones([width], device)),
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }

    /// Feature width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.gamma.val().dims()[0]
    }

    /// Normalizes `[rows, width]` input.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let (mean, var) = if B::ad_enabled() {
            self.batch_statistics(&x)
        } else {
            (
                self.running_mean.value_sync().unsqueeze::<2>(),
                self.running_var.value_sync().unsqueeze::<2>(),
            )
        };
        let std = var.add_scalar(self.epsilon).sqrt();
        x.sub(mean)
            .div(std)
            .mul(self.gamma.val().unsqueeze::<2>())
            .add(self.beta.val().unsqueeze::<2>())
    }

    fn batch_statistics(&self, x: &Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let rows = x.dims()[0];
        let mean = x.clone().mean_dim(0);
        let var = x.clone().sub(mean.clone()).powf_scalar(2.0).mean_dim(0);

        #[allow(clippy::cast_precision_loss)]
        let unbiased = if rows > 1 {
            rows as f64 / (rows - 1) as f64
        } else {
            1.0
        };
        let width = self.width();
        let m = self.momentum;
        let running_mean = self
            .running_mean
            .value_sync()
            .mul_scalar(1.0 - m)
            .add(mean.clone().detach().reshape([width]).mul_scalar(m));
        let running_var = self
            .running_var
            .value_sync()
            .mul_scalar(1.0 - m)
            .add(var.clone().detach().reshape([width]).mul_scalar(m * unbiased));
        self.running_mean.update(running_mean.detach());
        self.running_var.update(running_var.detach());

        (mean, var)
    }

    /// Forces the learnable scale to one.
    pub fn reset_scale(&mut self) {
        let device = self.gamma.val().device();
        let ones = Tensor::ones([self.width()], &device);
        self.gamma = Param::initialized(self.gamma.id, ones.require_grad());
    }

    /// Returns `(gamma, beta, running_mean, running_var)`.
    #[must_use]
    pub fn tensors(&self) -> [Tensor<B, 1>; 4] {
        [
            self.gamma.val(),
            self.beta.val(),
            self.running_mean.value_sync(),
            self.running_var.value_sync(),
        ]
    }

    /// Replaces all four tensors, keeping parameter identities.
    pub fn set_tensors(&mut self, [gamma, beta, mean, var]: [Tensor<B, 1>; 4]) {
        self.gamma = Param::initialized(self.gamma.id, gamma.detach().require_grad());
        self.beta = Param::initialized(self.beta.id, beta.detach().require_grad());
        self.running_mean = RunningState::new(mean.detach());
        self.running_var = RunningState::new(var.detach());
    }
}

/// One classifier stage: [`StageNorm`], row normalization and a class matrix.
///
/// # Example
///
/// ```
/// use burn_ndarray::NdArray;
/// use fsdet_models::{DenseLayer, Stage};
///
/// let device = Default::default();
/// let layer = DenseLayer::<NdArray<f32>>::new(Stage::Second, 60, 20, &device);
/// assert_eq!(layer.weights().dims(), [20, 80]);
/// ```
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    bn: StageNorm<B>,
    fc: Param<Tensor<B, 2>>,
    stage: usize,
}

impl<B: Backend> DenseLayer<B> {
    /// Creates a stage with random unit-norm class rows.
    #[must_use]
    pub fn new(stage: Stage, feature_dim: usize, n_way: usize, device: &B::Device) -> Self {
        let width = stage.input_width(feature_dim, n_way);
        let weights = Tensor::random([n_way, width], Distribution::Normal(0.0, 1.0), device);
        Self {
            bn: StageNorm::new(width, device),
            fc: Param::from_tensor(l2_normalize_rows(weights)),
            stage: stage.number(),
        }
    }

    /// The stage this layer implements.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidStage`] if the stored number is corrupt.
    pub fn stage(&self) -> Result<Stage> {
        Stage::try_from(self.stage)
    }

    /// Input width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.fc.val().dims()[1]
    }

    /// Number of class rows.
    #[must_use]
    pub fn n_way(&self) -> usize {
        self.fc.val().dims()[0]
    }

    /// Batch-norm sub-module.
    #[must_use]
    pub const fn norm(&self) -> &StageNorm<B> {
        &self.bn
    }

    /// Mutable batch-norm sub-module.
    pub const fn norm_mut(&mut self) -> &mut StageNorm<B> {
        &mut self.bn
    }

    /// Normalized embedding: batch-norm followed by row L2 normalization.
    pub fn composite(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        l2_normalize_rows(self.bn.forward(x))
    }

    /// Projects composite embeddings onto the class rows.
    pub fn project(&self, composite: Tensor<B, 2>) -> Tensor<B, 2> {
        composite.matmul(self.fc.val().transpose())
    }

    /// Class scores for `[rows, width]` input.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.project(self.composite(x))
    }

    /// Class matrix `[n_way, width]`.
    #[must_use]
    pub fn weights(&self) -> Tensor<B, 2> {
        self.fc.val()
    }

    /// Overwrites the class matrix, keeping the parameter identity.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ShapeMismatch`] if `weights` is not
    /// `[n_way, width]`.
    pub fn set_weights(&mut self, weights: Tensor<B, 2>) -> Result<()> {
        let expected = [self.n_way(), self.width()];
        let actual = weights.dims();
        if actual != expected {
            return Err(ModelError::shape_mismatch(&expected, &actual));
        }
        let device = self.fc.val().device();
        self.fc = Param::initialized(
            self.fc.id,
            weights.to_device(&device).detach().require_grad(),
        );
        Ok(())
    }

    /// Projects every class row back onto the unit sphere.
    pub fn normalize(&mut self) {
        let rows = l2_normalize_rows(self.fc.val()).detach();
        self.fc = Param::initialized(self.fc.id, rows.require_grad());
    }
}
