//! Training configuration.

use std::path::{Path, PathBuf};

use fsdet_models::{Architecture, CheckpointFormat, DatasetKind, RfbConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};

/// What imprinting does when a class collects no positive priors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ZeroPositivePolicy {
    /// Leave the class row untouched and log a warning.
    #[default]
    KeepPrevious,
    /// Abort with [`TrainingError::InsufficientData`].
    Fail,
}

/// Configuration for an imprint + fine-tune run.
///
/// Built once and passed by reference.
///
/// # Example
///
/// ```
/// use fsdet_training::TrainingConfig;
///
/// let config = TrainingConfig::default();
/// assert_eq!(config.max_epoch, 40);
/// assert_eq!(config.batch_size, 64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Network variant.
    pub version: Architecture,

    /// Input size, 300 or 512.
    pub size: u32,

    /// Dataset family.
    pub dataset: DatasetKind,

    /// Pretrained base weights, used when not resuming.
    pub basenet: Option<PathBuf>,

    /// Minimum IoU for a prior to match a ground-truth box.
    pub jaccard_threshold: f32,

    /// Class slots (images) per episode.
    pub batch_size: usize,

    /// Support images kept per class.
    pub n_shot_task: usize,

    /// Episodes per imprinting stage.
    pub support_episodes: usize,

    /// Episodes per fine-tuning epoch.
    pub train_episodes: usize,

    /// Episode loader threads; 0 loads on the training thread.
    pub num_workers: usize,

    /// Devices to spread each batch over.
    pub ngpu: usize,

    /// Optimizer configuration.
    pub optimizer: OptimizerConfig,

    /// Learning rate schedule.
    pub lr_schedule: LearningRateSchedule,

    /// State dict to resume from.
    pub resume_net: Option<PathBuf>,

    /// Epochs already completed by `resume_net`.
    pub resume_epoch: usize,

    /// Total fine-tuning epochs.
    pub max_epoch: usize,

    /// Write scalar summaries under `save_folder/logs`.
    pub log: bool,

    /// Checkpoint directory, created when missing.
    pub save_folder: PathBuf,

    /// Embedding width per prior.
    pub feature_dim: usize,

    /// Classifier rows.
    pub n_way: usize,

    /// Hard negatives mined per positive.
    pub negpos_ratio: usize,

    /// Epochs between intermediate checkpoints.
    pub checkpoint_every: usize,

    /// Iterations between progress lines.
    pub log_every: usize,

    /// Checkpoint encoding.
    pub checkpoint_format: CheckpointFormat,

    /// Zero-positive handling during imprinting.
    pub zero_positive: ZeroPositivePolicy,

    /// Seed for shot selection and episode sampling.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(DatasetKind::Voc)
    }
}

impl TrainingConfig {
    /// Creates a config with the stock settings for `dataset`.
    #[must_use]
    pub fn new(dataset: DatasetKind) -> Self {
        Self {
            version: Architecture::RfbVgg,
            size: 300,
            dataset,
            basenet: None,
            jaccard_threshold: 0.5,
            batch_size: 64,
            n_shot_task: 5,
            support_episodes: 50,
            train_episodes: 100,
            num_workers: 4,
            ngpu: 1,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LearningRateSchedule::for_dataset(dataset, 0.1),
            resume_net: None,
            resume_epoch: 0,
            max_epoch: 40,
            log: false,
            save_folder: PathBuf::from("./weights/"),
            feature_dim: 60,
            n_way: 20,
            negpos_ratio: 3,
            checkpoint_every: 2,
            log_every: 10,
            checkpoint_format: CheckpointFormat::Binary,
            zero_positive: ZeroPositivePolicy::KeepPrevious,
            seed: 0,
        }
    }

    /// Sets the network variant.
    #[must_use]
    pub const fn with_version(mut self, version: Architecture) -> Self {
        self.version = version;
        self
    }

    /// Sets the input size.
    #[must_use]
    pub const fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Sets the episode batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the support shots per class.
    #[must_use]
    pub const fn with_n_shot_task(mut self, n_shot: usize) -> Self {
        self.n_shot_task = n_shot;
        self
    }

    /// Sets the episode counts for imprinting and for each fine-tuning epoch.
    #[must_use]
    pub const fn with_episodes(mut self, support: usize, train: usize) -> Self {
        self.support_episodes = support;
        self.train_episodes = train;
        self
    }

    /// Sets the loader thread count.
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the device count.
    #[must_use]
    pub const fn with_ngpu(mut self, ngpu: usize) -> Self {
        self.ngpu = ngpu;
        self
    }

    /// Sets the optimizer.
    #[must_use]
    pub const fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Sets the learning rate schedule.
    #[must_use]
    pub fn with_lr_schedule(mut self, schedule: LearningRateSchedule) -> Self {
        self.lr_schedule = schedule;
        self
    }

    /// Resumes from `path` after `epoch` completed epochs.
    #[must_use]
    pub fn with_resume(mut self, path: impl Into<PathBuf>, epoch: usize) -> Self {
        self.resume_net = Some(path.into());
        self.resume_epoch = epoch;
        self
    }

    /// Sets the base weights.
    #[must_use]
    pub fn with_basenet(mut self, path: impl Into<PathBuf>) -> Self {
        self.basenet = Some(path.into());
        self
    }

    /// Sets the epoch count.
    #[must_use]
    pub const fn with_max_epoch(mut self, max_epoch: usize) -> Self {
        self.max_epoch = max_epoch;
        self
    }

    /// Sets the checkpoint directory.
    #[must_use]
    pub fn with_save_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.save_folder = folder.into();
        self
    }

    /// Sets the classifier shape.
    #[must_use]
    pub const fn with_classifier(mut self, feature_dim: usize, n_way: usize) -> Self {
        self.feature_dim = feature_dim;
        self.n_way = n_way;
        self
    }

    /// Enables scalar logging.
    #[must_use]
    pub const fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    /// Sets the zero-positive policy.
    #[must_use]
    pub const fn with_zero_positive(mut self, policy: ZeroPositivePolicy) -> Self {
        self.zero_positive = policy;
        self
    }

    /// Sets the checkpoint encoding.
    #[must_use]
    pub const fn with_checkpoint_format(mut self, format: CheckpointFormat) -> Self {
        self.checkpoint_format = format;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("n_shot_task", self.n_shot_task),
            ("support_episodes", self.support_episodes),
            ("train_episodes", self.train_episodes),
            ("ngpu", self.ngpu),
            ("max_epoch", self.max_epoch),
            ("feature_dim", self.feature_dim),
            ("n_way", self.n_way),
            ("checkpoint_every", self.checkpoint_every),
            ("log_every", self.log_every),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TrainingError::invalid_config(format!("{name} must be > 0")));
        }
        if !(self.jaccard_threshold > 0.0 && self.jaccard_threshold <= 1.0) {
            return Err(TrainingError::invalid_config(
                "jaccard_threshold must be in (0, 1]",
            ));
        }
        if self.resume_epoch > self.max_epoch {
            return Err(TrainingError::invalid_config(format!(
                "resume_epoch {} exceeds max_epoch {}",
                self.resume_epoch, self.max_epoch
            )));
        }
        if self.resume_epoch > 0 && self.resume_net.is_none() {
            return Err(TrainingError::invalid_config(
                "resume_epoch requires resume_net",
            ));
        }
        if !self.optimizer.is_valid() {
            return Err(TrainingError::invalid_config(format!(
                "invalid optimizer settings: {:?}",
                self.optimizer
            )));
        }
        self.model_config()?;
        Ok(())
    }

    /// Network configuration implied by the selectors.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] for an unsupported size.
    pub fn model_config(&self) -> Result<RfbConfig> {
        Ok(RfbConfig::for_selection(self.version, self.dataset, self.size)?
            .with_feature_dim(self.feature_dim)
            .with_n_way(self.n_way))
    }

    /// Creates the checkpoint directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Io`] if the directory cannot be created.
    pub fn ensure_save_folder(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.save_folder)?;
        Ok(&self.save_folder)
    }

    /// Iterations per epoch.
    #[must_use]
    pub const fn epoch_size(&self) -> usize {
        self.train_episodes
    }

    /// First fine-tuning iteration.
    #[must_use]
    pub const fn start_iter(&self) -> usize {
        self.resume_epoch * self.train_episodes
    }

    /// One past the last fine-tuning iteration.
    #[must_use]
    pub const fn max_iter(&self) -> usize {
        self.max_epoch * self.train_episodes
    }

    /// Checkpoint path (without extension) after `epoch` completed epochs.
    #[must_use]
    pub fn epoch_checkpoint_stem(&self, epoch: usize) -> PathBuf {
        self.save_folder.join(format!(
            "{}_{}_imprinted_epoches_{epoch}",
            self.version, self.dataset
        ))
    }

    /// Final checkpoint path (without extension).
    #[must_use]
    pub fn final_checkpoint_stem(&self) -> PathBuf {
        self.save_folder
            .join(format!("Final_{}_{}_imprinted", self.version, self.dataset))
    }

    /// Returns `true` if a checkpoint is due after `epoch` completed epochs.
    #[must_use]
    pub const fn should_checkpoint(&self, epoch: usize) -> bool {
        self.checkpoint_every > 0 && epoch % self.checkpoint_every == 0
    }
}

/// SGD settings.
///
/// # Example
///
/// ```
/// use fsdet_training::OptimizerConfig;
///
/// let sgd = OptimizerConfig::sgd_momentum(4e-3, 0.9).with_weight_decay(5e-4);
/// assert!((sgd.learning_rate - 4e-3).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Base learning rate.
    pub learning_rate: f64,

    /// Weight decay (L2 regularization).
    pub weight_decay: f64,

    /// Momentum.
    pub momentum: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd_momentum(4e-3, 0.9).with_weight_decay(5e-4)
    }
}

impl OptimizerConfig {
    /// Creates a plain SGD optimizer config.
    #[must_use]
    pub const fn sgd(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            weight_decay: 0.0,
            momentum: 0.0,
        }
    }

    /// Creates an SGD with momentum optimizer config.
    #[must_use]
    pub const fn sgd_momentum(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            weight_decay: 0.0,
            momentum,
        }
    }

    /// Sets weight decay.
    #[must_use]
    pub const fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Validates the configuration.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.learning_rate > 0.0
            && self.weight_decay >= 0.0
            && (0.0..=1.0).contains(&self.momentum)
    }
}

/// Milestone learning rate schedule, evaluated per epoch.
///
/// The schedule is stepped once at the start of every epoch, so 0-based
/// epoch `k` trains at schedule position `k + 1`: the rate decays by `gamma`
/// for every milestone `m <= k + 1`. A run resumed after `resume_epoch`
/// completed epochs therefore continues at the same rate as an
/// uninterrupted one.
///
/// # Example
///
/// ```
/// use fsdet_models::DatasetKind;
/// use fsdet_training::LearningRateSchedule;
///
/// let schedule = LearningRateSchedule::for_dataset(DatasetKind::Voc, 0.1);
/// assert!((schedule.compute_lr(1.0, 28) - 1.0).abs() < 1e-12);
/// assert!((schedule.compute_lr(1.0, 29) - 0.1).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateSchedule {
    /// Schedule positions at which the rate decays.
    pub milestones: Vec<usize>,
    /// Decay factor.
    pub gamma: f64,
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self::for_dataset(DatasetKind::default(), 0.1)
    }
}

impl LearningRateSchedule {
    /// Creates a milestone schedule.
    #[must_use]
    pub fn multi_step(milestones: Vec<usize>, gamma: f64) -> Self {
        Self { milestones, gamma }
    }

    /// Milestones used for each dataset family.
    #[must_use]
    pub fn for_dataset(dataset: DatasetKind, gamma: f64) -> Self {
        let milestones = match dataset {
            DatasetKind::Voc => vec![30, 35],
            DatasetKind::Coco => vec![30, 60, 90],
        };
        Self::multi_step(milestones, gamma)
    }

    /// Learning rate during 0-based `epoch`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn compute_lr(&self, base_lr: f64, epoch: usize) -> f64 {
        let position = epoch + 1;
        let decays = self.milestones.iter().filter(|&&m| m <= position).count();
        base_lr * self.gamma.powi(decays as i32)
    }
}
