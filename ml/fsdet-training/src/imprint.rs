//! Weight imprinting for the cascaded classifier.
//!
//! Each stage's class rows are synthesized from support data instead of
//! learned: positive-prior embeddings are pushed through the stage's
//! composite (batch-norm with running statistics, then L2 normalization),
//! averaged per class and projected back onto the unit sphere. Stages are
//! imprinted in cascade order, so stage `s` sees the freshly imprinted
//! projections of every earlier stage.
//!
//! The engine must run on a backend without autodiff (the trainer passes
//! `model.valid()`); on such a backend [`fsdet_models::StageNorm`] uses its
//! running statistics.

use burn::prelude::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use fsdet_dataset::DetectionBatch;
use fsdet_models::{DEFAULT_VARIANCE, DetectionNetwork, NORM_EPSILON, Stage};
use fsdet_types::Prior;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{TrainingConfig, ZeroPositivePolicy};
use crate::error::{Result, TrainingError};
use crate::matching::TargetBatch;
use crate::strategy::batch_images;

/// One input of a classifier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageInput {
    /// Raw prior embedding.
    Embedding,
    /// Unscaled class scores of an earlier stage.
    Scores(Stage),
}

/// Inputs of a stage, concatenated in order along the feature axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// The stage described.
    pub stage: Stage,
    /// Concatenated inputs.
    pub inputs: Vec<StageInput>,
}

impl StageDescriptor {
    /// Descriptor of `stage`: the embedding followed by every earlier
    /// stage's scores.
    #[must_use]
    pub fn for_stage(stage: Stage) -> Self {
        let inputs = std::iter::once(StageInput::Embedding)
            .chain(stage.predecessors().iter().copied().map(StageInput::Scores))
            .collect();
        Self { stage, inputs }
    }

    /// Descriptors of all three stages in order.
    #[must_use]
    pub fn cascade() -> Vec<Self> {
        Stage::ALL.into_iter().map(Self::for_stage).collect()
    }

    /// Concatenated input width.
    #[must_use]
    pub fn width(&self, feature_dim: usize, n_way: usize) -> usize {
        self.inputs
            .iter()
            .map(|input| match input {
                StageInput::Embedding => feature_dim,
                StageInput::Scores(_) => n_way,
            })
            .sum()
    }

    fn assemble<B: Backend>(
        &self,
        features: &Tensor<B, 2>,
        scores: &[(Stage, Tensor<B, 2>)],
    ) -> Tensor<B, 2> {
        let parts = self
            .inputs
            .iter()
            .filter_map(|input| match input {
                StageInput::Embedding => Some(features.clone()),
                StageInput::Scores(stage) => scores
                    .iter()
                    .find(|(s, _)| s == stage)
                    .map(|(_, t)| t.clone()),
            })
            .collect();
        Tensor::cat(parts, 1)
    }
}

/// Composite embedding of `target` for `[rows, feature_dim]` features.
///
/// Earlier stages are evaluated with their current class rows to produce the
/// score inputs.
pub fn stage_composite<B, N>(net: &N, target: Stage, features: Tensor<B, 2>) -> Tensor<B, 2>
where
    B: Backend,
    N: DetectionNetwork<B> + ?Sized,
{
    let mut scores = Vec::with_capacity(2);
    for &stage in target.predecessors() {
        let input = StageDescriptor::for_stage(stage).assemble(&features, &scores);
        scores.push((stage, net.dense_layer(stage).forward(input)));
    }
    let input = StageDescriptor::for_stage(target).assemble(&features, &scores);
    net.dense_layer(target).composite(input)
}

/// Outcome of imprinting one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// The stage.
    pub stage: Stage,
    /// Episodes consumed.
    pub episodes: usize,
    /// Positive priors collected per class slot.
    pub positives: Vec<usize>,
    /// Class slots left at their previous rows.
    pub skipped: Vec<usize>,
}

impl StageReport {
    /// Total positives over all classes.
    #[must_use]
    pub fn total_positives(&self) -> usize {
        self.positives.iter().sum()
    }
}

/// Outcome of a full imprinting pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImprintReport {
    /// Per-stage reports in cascade order.
    pub stages: Vec<StageReport>,
}

impl ImprintReport {
    /// Report of `stage`, if it ran.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Returns `true` if no class was skipped in any stage.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stages.iter().all(|r| r.skipped.is_empty())
    }
}

/// Per-class running sums of composite embeddings.
#[derive(Debug, Clone)]
struct ClassAccumulator {
    width: usize,
    sums: Vec<f32>,
    counts: Vec<usize>,
}

impl ClassAccumulator {
    fn new(n_way: usize, width: usize) -> Self {
        Self {
            width,
            sums: vec![0.0; n_way * width],
            counts: vec![0; n_way],
        }
    }

    fn add(&mut self, slot: usize, row: &[f32]) {
        let sum = &mut self.sums[slot * self.width..(slot + 1) * self.width];
        for (s, &v) in sum.iter_mut().zip(row) {
            *s += v;
        }
        self.counts[slot] += 1;
    }

    /// Unit-norm class mean, or `None` for a class without samples.
    #[allow(clippy::cast_precision_loss)]
    fn prototype(&self, slot: usize) -> Option<Vec<f32>> {
        let count = self.counts[slot];
        if count == 0 {
            return None;
        }
        let mean: Vec<f32> = self.sums[slot * self.width..(slot + 1) * self.width]
            .iter()
            .map(|&s| s / count as f32)
            .collect();
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPSILON);
        Some(mean.into_iter().map(|v| v / norm).collect())
    }
}

/// Synthesizes classifier weights from support episodes.
///
/// # Example
///
/// ```
/// use fsdet_training::{ImprintingEngine, ZeroPositivePolicy};
///
/// let engine = ImprintingEngine::new(50, ZeroPositivePolicy::Fail).with_threshold(0.4);
/// assert_eq!(engine.support_episodes(), 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImprintingEngine {
    threshold: f32,
    variance: [f32; 2],
    support_episodes: usize,
    policy: ZeroPositivePolicy,
}

impl ImprintingEngine {
    /// Creates an engine with a 0.5 match threshold and the default
    /// variances.
    #[must_use]
    pub const fn new(support_episodes: usize, policy: ZeroPositivePolicy) -> Self {
        Self {
            threshold: 0.5,
            variance: DEFAULT_VARIANCE,
            support_episodes,
            policy,
        }
    }

    /// Engine matching a training configuration.
    #[must_use]
    pub const fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.support_episodes, config.zero_positive).with_threshold(config.jaccard_threshold)
    }

    /// Sets the prior match threshold.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the box encoding variances.
    #[must_use]
    pub const fn with_variance(mut self, variance: [f32; 2]) -> Self {
        self.variance = variance;
        self
    }

    /// Episodes consumed per stage.
    #[must_use]
    pub const fn support_episodes(&self) -> usize {
        self.support_episodes
    }

    /// Imprints all three stages of `net`.
    ///
    /// `episodes` is called once per stage and must yield at least
    /// `support_episodes` batches; `priors` is the prior list the network's
    /// outputs are aligned with.
    ///
    /// # Errors
    ///
    /// - [`TrainingError::EpisodesExhausted`] if a stage's stream runs short
    /// - [`TrainingError::InsufficientData`] for a class without positives
    ///   under [`ZeroPositivePolicy::Fail`]
    /// - dataset and model errors from loading or writing weights
    pub fn imprint<B, N, F, I>(
        &self,
        net: &mut N,
        mut episodes: F,
        priors: &[Prior],
    ) -> Result<ImprintReport>
    where
        B: Backend,
        N: DetectionNetwork<B> + ?Sized,
        F: FnMut(Stage) -> Result<I>,
        I: Iterator<Item = fsdet_dataset::Result<DetectionBatch>>,
    {
        if priors.len() != net.num_priors() {
            return Err(TrainingError::model(format!(
                "network scores {} priors but {} were supplied",
                net.num_priors(),
                priors.len()
            )));
        }
        net.reset_stage_scales();

        let mut report = ImprintReport::default();
        for stage in Stage::ALL {
            let stage_report = self.imprint_stage(net, stage, episodes(stage)?, priors)?;
            report.stages.push(stage_report);
        }
        Ok(report)
    }

    fn imprint_stage<B, N, I>(
        &self,
        net: &mut N,
        stage: Stage,
        episodes: I,
        priors: &[Prior],
    ) -> Result<StageReport>
    where
        B: Backend,
        N: DetectionNetwork<B> + ?Sized,
        I: Iterator<Item = fsdet_dataset::Result<DetectionBatch>>,
    {
        let n_way = net.n_way();
        let feature_dim = net.feature_dim();
        let width = stage.input_width(feature_dim, n_way);
        let device = net.classifier_weights(stage).device();
        info!(stage = stage.number(), width, "Imprinting {stage}");

        let mut accumulator = ClassAccumulator::new(n_way, width);
        let mut targets = TargetBatch::new(0, priors.len());
        let mut delivered = 0;
        for batch in episodes.take(self.support_episodes) {
            let batch = batch?;
            delivered += 1;

            targets.match_batch(self.threshold, &batch.targets, priors, self.variance);
            let [n, _, _, _] = batch.shape();
            let rows: Vec<usize> = targets
                .obj_flat()
                .iter()
                .enumerate()
                .filter_map(|(i, &o)| o.then_some(i))
                .collect();
            debug!(
                stage = stage.number(),
                episode = delivered,
                positives = rows.len(),
                "Support episode"
            );
            if rows.is_empty() {
                continue;
            }

            let embedding = net
                .embed(batch_images(&batch, &device))
                .reshape([n * priors.len(), feature_dim]);
            #[allow(clippy::cast_possible_wrap)]
            let index: Vec<i64> = rows.iter().map(|&r| r as i64).collect();
            let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [rows.len()]), &device);
            let composite = stage_composite(net, stage, embedding.select(0, index));
            let values = composite
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| TrainingError::model(format!("embedding readback: {e:?}")))?;

            for (k, &row) in rows.iter().enumerate() {
                let label = targets.conf_flat()[row];
                match usize::try_from(label - 1) {
                    Ok(slot) if slot < n_way => {
                        accumulator.add(slot, &values[k * width..(k + 1) * width]);
                    }
                    _ => debug!(label, "Label outside classifier range"),
                }
            }
        }
        if delivered < self.support_episodes {
            return Err(TrainingError::EpisodesExhausted {
                expected: self.support_episodes,
                delivered,
            });
        }

        let previous = net
            .classifier_weights(stage)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TrainingError::model(format!("classifier readback: {e:?}")))?;
        let mut matrix = Vec::with_capacity(n_way * width);
        let mut skipped = Vec::new();
        for slot in 0..n_way {
            if let Some(row) = accumulator.prototype(slot) {
                matrix.extend(row);
                continue;
            }
            match self.policy {
                ZeroPositivePolicy::Fail => {
                    return Err(TrainingError::insufficient_data(stage.number(), slot));
                }
                ZeroPositivePolicy::KeepPrevious => {
                    warn!(
                        stage = stage.number(),
                        class = slot,
                        "No positives for class; keeping previous weights"
                    );
                    matrix.extend_from_slice(&previous[slot * width..(slot + 1) * width]);
                    skipped.push(slot);
                }
            }
        }
        let weights = Tensor::<B, 2>::from_data(TensorData::new(matrix, [n_way, width]), &device);
        net.set_classifier_weights(stage, weights)?;

        info!(
            stage = stage.number(),
            episodes = delivered,
            positives = accumulator.counts.iter().sum::<usize>(),
            skipped = skipped.len(),
            "Imprinted {stage}"
        );
        Ok(StageReport {
            stage,
            episodes: delivered,
            positives: accumulator.counts,
            skipped,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;
    use fsdet_dataset::DatasetError;
    use fsdet_models::{DenseLayer, DetectionOutput};
    use fsdet_types::{Annotation, BoundingBox};

    type TestBackend = NdArray<f32>;

    /// Two priors (left and right halves) embedded as `[1, 0]` and `[0, 1]`.
    struct HalvesNet {
        layers: [DenseLayer<TestBackend>; 3],
    }

    impl HalvesNet {
        fn new() -> Self {
            let device = Default::default();
            Self {
                layers: Stage::ALL.map(|s| DenseLayer::new(s, 2, 2, &device)),
            }
        }
    }

    impl DetectionNetwork<TestBackend> for HalvesNet {
        fn forward(&self, images: Tensor<TestBackend, 4>) -> DetectionOutput<TestBackend> {
            let n = images.dims()[0];
            let device = images.device();
            DetectionOutput {
                loc: Tensor::zeros([n, 2, 4], &device),
                conf: Tensor::zeros([n, 2, 2], &device),
                obj: Tensor::zeros([n, 2, 2], &device),
            }
        }

        fn embed(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 3> {
            let n = images.dims()[0];
            let data: Vec<f32> = (0..n).flat_map(|_| [1.0, 0.0, 0.0, 1.0]).collect();
            Tensor::from_data(TensorData::new(data, [n, 2, 2]), &images.device())
        }

        fn dense_layer(&self, stage: Stage) -> &DenseLayer<TestBackend> {
            &self.layers[stage.number() - 1]
        }

        fn dense_layer_mut(&mut self, stage: Stage) -> &mut DenseLayer<TestBackend> {
            &mut self.layers[stage.number() - 1]
        }

        fn n_way(&self) -> usize {
            2
        }

        fn feature_dim(&self) -> usize {
            2
        }

        fn num_priors(&self) -> usize {
            2
        }
    }

    fn priors() -> Vec<Prior> {
        vec![
            Prior::new(0.25, 0.5, 0.5, 1.0),
            Prior::new(0.75, 0.5, 0.5, 1.0),
        ]
    }

    fn batch(objects: Vec<Annotation>) -> DetectionBatch {
        DetectionBatch {
            images: vec![0.0; 3 * 4 * 4],
            batch_size: 1,
            channels: 3,
            height: 4,
            width: 4,
            targets: vec![objects],
        }
    }

    fn both_halves() -> DetectionBatch {
        batch(vec![
            Annotation::new(BoundingBox::new(0.0, 0.0, 0.5, 1.0), 1),
            Annotation::new(BoundingBox::new(0.5, 0.0, 1.0, 1.0), 2),
        ])
    }

    fn repeat(
        batch: DetectionBatch,
        n: usize,
    ) -> impl FnMut(Stage) -> Result<std::vec::IntoIter<fsdet_dataset::Result<DetectionBatch>>> {
        move |_| {
            Ok((0..n)
                .map(|_| Ok::<_, DatasetError>(batch.clone()))
                .collect::<Vec<_>>()
                .into_iter())
        }
    }

    fn weights(net: &HalvesNet, stage: Stage) -> Vec<f32> {
        net.classifier_weights(stage)
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn descriptors_follow_cascade() {
        let cascade = StageDescriptor::cascade();
        assert_eq!(cascade.len(), 3);
        assert_eq!(cascade[0].inputs, vec![StageInput::Embedding]);
        assert_eq!(
            cascade[2].inputs,
            vec![
                StageInput::Embedding,
                StageInput::Scores(Stage::First),
                StageInput::Scores(Stage::Second)
            ]
        );
        let widths: Vec<usize> = cascade.iter().map(|d| d.width(60, 20)).collect();
        assert_eq!(widths, vec![60, 80, 100]);
    }

    #[test]
    fn orthogonal_embeddings_imprint_identity() {
        let mut net = HalvesNet::new();
        let engine = ImprintingEngine::new(3, ZeroPositivePolicy::Fail);
        let report = engine
            .imprint(&mut net, repeat(both_halves(), 3), &priors())
            .unwrap();

        let first = weights(&net, Stage::First);
        for (value, expected) in first.iter().zip([1.0, 0.0, 0.0, 1.0]) {
            assert_relative_eq!(*value, expected, epsilon = 1e-4);
        }

        // [f, s1] = [1, 0, 1, 0] for class 1
        let half = 0.5f32.sqrt();
        let second = weights(&net, Stage::Second);
        for (value, expected) in second.iter().zip([half, 0.0, half, 0.0, 0.0, half, 0.0, half]) {
            assert_relative_eq!(*value, expected, epsilon = 1e-4);
        }

        let third = 1.0 / 3.0f32.sqrt();
        let row0 = &weights(&net, Stage::Third)[..6];
        for (value, expected) in row0.iter().zip([third, 0.0, third, 0.0, third, 0.0]) {
            assert_relative_eq!(*value, expected, epsilon = 1e-4);
        }

        assert!(report.is_complete());
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.stage(Stage::Second).unwrap().positives, vec![3, 3]);
        assert_eq!(report.stage(Stage::Third).unwrap().episodes, 3);
    }

    #[test]
    fn imprinted_rows_are_unit_norm() {
        let mut net = HalvesNet::new();
        let skewed = batch(vec![
            Annotation::new(BoundingBox::new(0.0, 0.0, 0.5, 1.0), 2),
            Annotation::new(BoundingBox::new(0.5, 0.0, 1.0, 1.0), 1),
        ]);
        ImprintingEngine::new(2, ZeroPositivePolicy::Fail)
            .imprint(&mut net, repeat(skewed, 2), &priors())
            .unwrap();
        for stage in Stage::ALL {
            let norms = net
                .classifier_weights(stage)
                .powf_scalar(2.0)
                .sum_dim(1)
                .sqrt()
                .into_data()
                .to_vec::<f32>()
                .unwrap();
            for norm in norms {
                assert_relative_eq!(norm, 1.0, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn missing_class_keeps_previous_row() {
        let mut net = HalvesNet::new();
        let before = weights(&net, Stage::First);
        let left_only = batch(vec![Annotation::new(BoundingBox::new(0.0, 0.0, 0.5, 1.0), 1)]);

        let report = ImprintingEngine::new(2, ZeroPositivePolicy::KeepPrevious)
            .imprint(&mut net, repeat(left_only, 2), &priors())
            .unwrap();

        let after = weights(&net, Stage::First);
        assert_relative_eq!(after[0], 1.0, epsilon = 1e-4);
        assert_eq!(&after[2..], &before[2..]);
        assert_eq!(report.stage(Stage::First).unwrap().skipped, vec![1]);
        assert!(!report.is_complete());
    }

    #[test]
    fn missing_class_fails_under_strict_policy() {
        let mut net = HalvesNet::new();
        let left_only = batch(vec![Annotation::new(BoundingBox::new(0.0, 0.0, 0.5, 1.0), 1)]);
        let result = ImprintingEngine::new(2, ZeroPositivePolicy::Fail).imprint(
            &mut net,
            repeat(left_only, 2),
            &priors(),
        );
        assert!(matches!(
            result,
            Err(TrainingError::InsufficientData { stage: 1, class: 1 })
        ));
    }

    #[test]
    fn short_stream_is_an_error() {
        let mut net = HalvesNet::new();
        let result = ImprintingEngine::new(5, ZeroPositivePolicy::KeepPrevious).imprint(
            &mut net,
            repeat(both_halves(), 2),
            &priors(),
        );
        assert!(matches!(
            result,
            Err(TrainingError::EpisodesExhausted {
                expected: 5,
                delivered: 2
            })
        ));
    }

    #[test]
    fn prior_count_must_match_network() {
        let mut net = HalvesNet::new();
        let result = ImprintingEngine::new(1, ZeroPositivePolicy::KeepPrevious).imprint(
            &mut net,
            repeat(both_halves(), 1),
            &priors()[..1],
        );
        assert!(matches!(result, Err(TrainingError::Model(_))));
    }

    #[test]
    fn engine_from_config() {
        let config = TrainingConfig::default().with_episodes(7, 10);
        let engine = ImprintingEngine::from_config(&config);
        assert_eq!(engine.support_episodes(), 7);
        assert_relative_eq!(engine.threshold, 0.5);
    }
}
