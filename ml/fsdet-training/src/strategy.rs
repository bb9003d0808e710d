//! Single-device and data-parallel gradient computation.

use burn::module::AutodiffModule;
use burn::optim::GradientsAccumulator;
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Tensor, TensorData};
use fsdet_dataset::DetectionBatch;
use fsdet_models::{DetectionNetwork, GradientGroup, GradientGroups};
use tracing::debug;

use crate::error::{Result, TrainingError};
use crate::loss::{LossValues, MultiBoxLoss};
use crate::matching::TargetBatch;

/// Uploads a batch's images as an `[N, C, H, W]` tensor.
#[must_use]
pub fn batch_images<B: Backend>(batch: &DetectionBatch, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(batch.images.clone(), batch.shape()), device)
}

/// Gradients and host loss values of one iteration.
#[derive(Debug)]
pub struct BackwardStep {
    /// Loss components of the whole batch.
    pub losses: LossValues,
    /// Gradients on the main device, grouped by learning rate.
    pub groups: Vec<GradientGroup>,
}

/// Where the forward and backward passes run.
///
/// With [`ExecutionStrategy::DataParallel`] every batch is split into
/// contiguous shards, one per device. Each shard runs on a replica forked
/// from the model and its loss is normalized by the positives of the whole
/// batch, so the shard losses sum to the full-batch loss. The resulting
/// gradients are moved to the first device and summed there, and the
/// optimizer steps once per iteration on the main model.
#[derive(Debug, Clone)]
pub enum ExecutionStrategy<B: Backend> {
    /// Everything on one device.
    SingleDevice(B::Device),
    /// Batch shards fanned out over several devices; the first is the main one.
    DataParallel {
        /// Participating devices.
        devices: Vec<B::Device>,
    },
}

impl<B: AutodiffBackend> ExecutionStrategy<B> {
    /// Picks a strategy for `devices`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] for an empty device list.
    pub fn from_devices(mut devices: Vec<B::Device>) -> Result<Self> {
        match devices.len() {
            0 => Err(TrainingError::invalid_config("no devices to train on")),
            1 => Ok(Self::SingleDevice(devices.remove(0))),
            _ => Ok(Self::DataParallel { devices }),
        }
    }

    /// Uses `device` `count` times (at least once).
    ///
    /// # Errors
    ///
    /// Never fails for `count > 0`; kept fallible for symmetry with
    /// [`ExecutionStrategy::from_devices`].
    pub fn replicated(device: &B::Device, count: usize) -> Result<Self> {
        Self::from_devices(vec![device.clone(); count.max(1)])
    }

    /// Device holding the main model.
    #[must_use]
    pub fn main_device(&self) -> &B::Device {
        match self {
            Self::SingleDevice(device) => device,
            Self::DataParallel { devices } => &devices[0],
        }
    }

    /// Number of devices used.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        match self {
            Self::SingleDevice(_) => 1,
            Self::DataParallel { devices } => devices.len(),
        }
    }

    /// Runs forward and backward for one batch.
    ///
    /// `targets` must already be matched for the whole batch.
    ///
    /// # Errors
    ///
    /// Propagates loss errors.
    pub fn backward<M>(
        &self,
        model: &M,
        batch: &DetectionBatch,
        targets: &TargetBatch,
        criterion: &MultiBoxLoss,
    ) -> Result<BackwardStep>
    where
        M: AutodiffModule<B> + DetectionNetwork<B> + GradientGroups<B>,
    {
        match self {
            Self::SingleDevice(device) => {
                let output = model.forward(batch_images(batch, device));
                let components = criterion.forward(&output, targets)?;
                let losses = components.values();
                let mut grads = components.total().backward();
                Ok(BackwardStep {
                    losses,
                    groups: model.gradient_groups(&mut grads),
                })
            }
            Self::DataParallel { devices } => {
                self.backward_sharded(model, devices, batch, targets, criterion)
            }
        }
    }

    fn backward_sharded<M>(
        &self,
        model: &M,
        devices: &[B::Device],
        batch: &DetectionBatch,
        targets: &TargetBatch,
        criterion: &MultiBoxLoss,
    ) -> Result<BackwardStep>
    where
        M: AutodiffModule<B> + DetectionNetwork<B> + GradientGroups<B>,
    {
        let main = self.main_device();
        let num_positives = targets.num_positives();

        let mut losses = LossValues::default();
        let mut meta: Vec<(&'static str, f64)> = Vec::new();
        let mut accumulators: Vec<GradientsAccumulator<M>> = Vec::new();
        let mut start = 0;
        for (shard, device) in batch.shard(devices.len()).iter().zip(devices) {
            let replica = model.clone().fork(device);
            let shard_targets = targets.slice(start, shard.batch_size);
            start += shard.batch_size;

            let output = replica.forward(batch_images(shard, device));
            let components = criterion.forward_normalized(&output, &shard_targets, num_positives)?;
            losses += components.values();

            let mut grads = components.total().backward();
            let groups = replica.gradient_groups(&mut grads);
            if accumulators.is_empty() {
                meta = groups.iter().map(|g| (g.name, g.lr_factor)).collect();
                accumulators = groups.iter().map(|_| GradientsAccumulator::new()).collect();
            }
            for (accumulator, group) in accumulators.iter_mut().zip(groups) {
                accumulator.accumulate(model, group.grads.to_device(main, model));
            }
            debug!(images = shard.batch_size, positives = shard_targets.num_positives(), "Shard backward");
        }

        let groups = meta
            .into_iter()
            .zip(accumulators.iter_mut())
            .map(|((name, lr_factor), accumulator)| GradientGroup {
                name,
                lr_factor,
                grads: accumulator.grads(),
            })
            .collect();
        Ok(BackwardStep { losses, groups })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use fsdet_models::{Architecture, DEFAULT_VARIANCE, PriorBox, PriorBoxConfig, RfbConfig};
    use fsdet_types::{Annotation, BoundingBox};

    type TestAutodiff = Autodiff<NdArray<f32>>;

    fn tiny_config() -> RfbConfig {
        RfbConfig::new(
            Architecture::RfbVgg,
            PriorBoxConfig {
                image_size: 32,
                feature_maps: vec![4, 2, 1],
                steps: vec![8.0, 16.0, 32.0],
                min_sizes: vec![8.0, 16.0, 24.0],
                max_sizes: vec![16.0, 24.0, 32.0],
                aspect_ratios: vec![vec![2.0], vec![2.0], vec![2.0]],
                variance: DEFAULT_VARIANCE,
                clip: true,
            },
        )
        .with_base_channels(vec![4, 8, 8])
        .with_source_channels(8)
        .with_feature_dim(6)
        .with_n_way(3)
    }

    fn batch(n: usize) -> DetectionBatch {
        #[allow(clippy::cast_precision_loss)]
        let images = (0..n * 3 * 32 * 32).map(|i| (i % 7) as f32 / 7.0).collect();
        DetectionBatch {
            images,
            batch_size: n,
            channels: 3,
            height: 32,
            width: 32,
            targets: (0..n)
                .map(|i| {
                    #[allow(clippy::cast_possible_truncation)]
                    let label = (i % 3) as u32 + 1;
                    vec![Annotation::new(BoundingBox::new(0.1, 0.1, 0.6, 0.6), label)]
                })
                .collect(),
        }
    }

    fn targets(config: &RfbConfig, batch: &DetectionBatch) -> TargetBatch {
        let priors = PriorBox::new(config.priors.clone()).unwrap().generate();
        let mut targets = TargetBatch::new(batch.batch_size, priors.len());
        targets.match_batch(0.5, &batch.targets, &priors, DEFAULT_VARIANCE);
        targets
    }

    #[test]
    fn strategy_selection() {
        let device = <TestAutodiff as Backend>::Device::default();
        let single = ExecutionStrategy::<TestAutodiff>::from_devices(vec![device.clone()]).unwrap();
        assert!(matches!(single, ExecutionStrategy::SingleDevice(_)));
        assert_eq!(single.num_devices(), 1);

        let parallel = ExecutionStrategy::<TestAutodiff>::replicated(&device, 3).unwrap();
        assert_eq!(parallel.num_devices(), 3);
        assert!(ExecutionStrategy::<TestAutodiff>::from_devices(Vec::new()).is_err());
    }

    #[test]
    fn images_upload_in_nchw() {
        let device = Default::default();
        let images = batch_images::<NdArray<f32>>(&batch(2), &device);
        assert_eq!(images.dims(), [2, 3, 32, 32]);
    }

    #[test]
    fn single_device_backward_produces_groups() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestAutodiff>(&device).unwrap();
        let batch = batch(2);
        let targets = targets(&config, &batch);
        assert!(targets.num_positives() > 0);

        let step = ExecutionStrategy::<TestAutodiff>::SingleDevice(device)
            .backward(&model, &batch, &targets, &MultiBoxLoss::default())
            .unwrap();
        assert!(step.losses.is_finite());
        assert!(step.losses.total() > 0.0);
        let names: Vec<_> = step.groups.iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["base", "extras", "heads"]);
        assert!(step.groups.iter().all(|g| !g.grads.is_empty()));
    }

    #[test]
    fn data_parallel_matches_single_device_on_uneven_positives() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestAutodiff>(&device).unwrap();

        // identical pixels keep per-shard batch statistics equal to the full batch
        #[allow(clippy::cast_precision_loss)]
        let image: Vec<f32> = (0..3 * 32 * 32).map(|i| (i % 11) as f32 / 11.0).collect();
        let batch = DetectionBatch {
            images: [image.clone(), image].concat(),
            batch_size: 2,
            channels: 3,
            height: 32,
            width: 32,
            targets: vec![
                vec![
                    Annotation::new(BoundingBox::new(0.0, 0.0, 0.3, 0.3), 1),
                    Annotation::new(BoundingBox::new(0.5, 0.5, 1.0, 1.0), 2),
                    Annotation::new(BoundingBox::new(0.0, 0.6, 0.4, 1.0), 3),
                    Annotation::new(BoundingBox::new(0.1, 0.1, 0.9, 0.9), 2),
                ],
                vec![Annotation::new(BoundingBox::new(0.6, 0.0, 0.8, 0.2), 1)],
            ],
        };
        let targets = targets(&config, &batch);
        assert!(targets.positives(0) > targets.positives(1));

        let criterion = MultiBoxLoss::default();
        let single = ExecutionStrategy::<TestAutodiff>::SingleDevice(device.clone())
            .backward(&model, &batch, &targets, &criterion)
            .unwrap()
            .losses;
        let parallel = ExecutionStrategy::<TestAutodiff>::replicated(&device, 2)
            .unwrap()
            .backward(&model, &batch, &targets, &criterion)
            .unwrap()
            .losses;

        assert_relative_eq!(parallel.loc, single.loc, max_relative = 1e-4);
        assert_relative_eq!(parallel.conf, single.conf, max_relative = 1e-4);
        assert_relative_eq!(parallel.obj, single.obj, max_relative = 1e-4);
    }

    #[test]
    fn data_parallel_merges_shard_gradients() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestAutodiff>(&device).unwrap();
        let batch = batch(3);
        let targets = targets(&config, &batch);

        let strategy = ExecutionStrategy::<TestAutodiff>::replicated(&device, 2).unwrap();
        let step = strategy
            .backward(&model, &batch, &targets, &MultiBoxLoss::default())
            .unwrap();
        assert!(step.losses.is_finite());
        assert_eq!(step.groups.len(), 3);
        assert_eq!(step.groups[0].grads.len(), 6);
        assert!(!step.groups[2].grads.is_empty());
    }
}
