//! Imprint-then-fine-tune driver.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{Optimizer, SgdConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;
use fsdet_dataset::{EpisodeLoader, EpisodeStream, EpisodicBatchSampler, SamplerPhase};
use fsdet_models::{
    BASE_LR_FACTOR, DetectionNetwork, ImprintedRfb, PriorBox, RfbConfig, Stage, StateDict,
};
use fsdet_types::Prior;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::error::{Result, TrainingError};
use crate::imprint::{ImprintReport, ImprintingEngine};
use crate::loss::{LossValues, MultiBoxLoss};
use crate::matching::TargetBatch;
use crate::metrics::{EpochMetrics, ScalarLogger, TrainingMetrics};
use crate::strategy::ExecutionStrategy;

/// Progress of a fine-tuning run.
///
/// # Example
///
/// ```
/// use fsdet_training::{LossValues, TrainingState};
///
/// let mut state = TrainingState::new(2);
/// state.record_iteration(LossValues::new(1.0, 1.0, 1.0));
/// let epoch = state.next_epoch(4e-3, 1.0);
/// assert_eq!(epoch.iterations, 1);
/// assert_eq!(state.epoch, 1);
/// assert!(!state.is_finished());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs.
    pub epoch: usize,

    /// Next global iteration.
    pub iteration: usize,

    /// Total epochs to run.
    pub total_epochs: usize,

    /// Whether training has finished.
    pub finished: bool,

    /// Accumulated metrics.
    pub metrics: TrainingMetrics,

    epoch_losses: LossValues,
    epoch_iterations: usize,
    non_finite: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TrainingState {
    /// Creates a state at epoch zero.
    #[must_use]
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            total_epochs,
            finished: total_epochs == 0,
            metrics: TrainingMetrics::new(),
            epoch_losses: LossValues::default(),
            epoch_iterations: 0,
            non_finite: 0,
        }
    }

    /// Creates a state positioned after the resumed epochs.
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            epoch: config.resume_epoch,
            iteration: config.start_iter(),
            finished: config.resume_epoch >= config.max_epoch,
            ..Self::new(config.max_epoch)
        }
    }

    /// Returns true if training is finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the progress as a fraction [0, 1].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f32 {
        if self.total_epochs == 0 {
            0.0
        } else {
            self.epoch as f32 / self.total_epochs as f32
        }
    }

    /// Iterations run in the current epoch.
    #[must_use]
    pub const fn epoch_iterations(&self) -> usize {
        self.epoch_iterations
    }

    /// Adds one iteration's losses to the running epoch sums.
    pub fn record_iteration(&mut self, losses: LossValues) {
        if losses.is_finite() {
            self.epoch_losses += losses;
        } else {
            self.non_finite += 1;
        }
        self.epoch_iterations += 1;
        self.iteration += 1;
    }

    /// Closes the current epoch and returns its metrics.
    pub fn next_epoch(&mut self, learning_rate: f64, secs: f32) -> EpochMetrics {
        let metrics = EpochMetrics::new(self.epoch, self.epoch_losses, self.epoch_iterations)
            .with_learning_rate(learning_rate)
            .with_train_time(secs)
            .with_non_finite(self.non_finite);
        self.metrics.add_epoch(metrics.clone());

        self.epoch += 1;
        self.epoch_losses = LossValues::default();
        self.epoch_iterations = 0;
        self.non_finite = 0;
        if self.epoch >= self.total_epochs {
            self.finished = true;
        }
        metrics
    }
}

/// Result of [`Trainer::run`].
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    /// Fine-tuned network.
    pub model: ImprintedRfb<B>,
    /// Imprinting summary.
    pub imprint: ImprintReport,
    /// Final fine-tuning state.
    pub state: TrainingState,
    /// Path of the final checkpoint.
    pub final_checkpoint: PathBuf,
}

/// Runs imprinting followed by episodic fine-tuning.
///
/// # Example
///
/// ```
/// use fsdet_training::{Trainer, TrainingConfig};
///
/// let trainer = Trainer::new(TrainingConfig::default()).unwrap();
/// assert_eq!(trainer.config().max_epoch, 40);
/// assert!((trainer.compute_lr(29) - 4e-4).abs() < 1e-12);
/// assert!((trainer.compute_lr(34) - 4e-5).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
    model: RfbConfig,
    criterion: MultiBoxLoss,
}

impl Trainer {
    /// Creates a trainer, validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] for an invalid configuration.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let model = config.model_config()?;
        let criterion = MultiBoxLoss::new(config.negpos_ratio);
        Ok(Self {
            config,
            model,
            criterion,
        })
    }

    /// Replaces the network configuration derived from the selectors.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::InvalidConfig`] if `model` is invalid or its
    /// classifier shape disagrees with the training configuration.
    pub fn with_model_config(mut self, model: RfbConfig) -> Result<Self> {
        model.validate()?;
        if model.feature_dim != self.config.feature_dim || model.n_way != self.config.n_way {
            return Err(TrainingError::invalid_config(format!(
                "network classifier {}x{} does not match configured {}x{}",
                model.n_way, model.feature_dim, self.config.n_way, self.config.feature_dim
            )));
        }
        self.model = model;
        Ok(self)
    }

    /// Returns the training configuration.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Returns the network configuration.
    #[must_use]
    pub const fn model_config(&self) -> &RfbConfig {
        &self.model
    }

    /// Base learning rate during 0-based `epoch`.
    #[must_use]
    pub fn compute_lr(&self, epoch: usize) -> f64 {
        self.config
            .lr_schedule
            .compute_lr(self.config.optimizer.learning_rate, epoch)
    }

    /// Generates the priors the network is aligned with.
    ///
    /// # Errors
    ///
    /// Returns an error if the prior configuration is invalid.
    pub fn priors(&self) -> Result<Vec<Prior>> {
        Ok(PriorBox::new(self.model.priors.clone())?.generate())
    }

    /// Sampler for imprinting `stage`.
    ///
    /// # Errors
    ///
    /// Returns a dataset error for zero classes.
    pub fn support_sampler(&self, n_classes: usize, stage: Stage) -> Result<EpisodicBatchSampler> {
        let seed = self.config.seed.rotate_left(32) ^ stage.number() as u64;
        Ok(EpisodicBatchSampler::new(
            n_classes,
            self.config.batch_size,
            self.config.support_episodes,
            SamplerPhase::Train,
            seed,
        )?)
    }

    /// Sampler for fine-tuning; derive per-epoch samplers with
    /// [`EpisodicBatchSampler::for_epoch`].
    ///
    /// # Errors
    ///
    /// Returns a dataset error for zero classes.
    pub fn train_sampler(&self, n_classes: usize) -> Result<EpisodicBatchSampler> {
        Ok(EpisodicBatchSampler::new(
            n_classes,
            self.config.batch_size,
            self.config.train_episodes,
            SamplerPhase::Train,
            self.config.seed,
        )?)
    }

    /// Builds the network and restores `resume_net` or `basenet` weights.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if a configured weight file cannot be read.
    pub fn build_model<B: Backend>(&self, device: &B::Device) -> Result<ImprintedRfb<B>> {
        let model = self.model.init::<B>(device)?;
        if let Some(path) = &self.config.resume_net {
            info!(path = %path.display(), epoch = self.config.resume_epoch, "Resuming training");
            let (model, report) = model.load_state_dict(&StateDict::load(path)?);
            report.log("resume_net");
            return Ok(model);
        }
        if let Some(path) = &self.config.basenet {
            info!(path = %path.display(), "Loading base network");
            let (model, report) = model.load_base_state_dict(&StateDict::load(path)?);
            report.log("basenet");
            return Ok(model);
        }
        debug!("Training from initialized weights");
        Ok(model)
    }

    /// Imprints all classifier stages of `model` from support episodes.
    ///
    /// Runs on the model's inner backend and copies the synthesized class
    /// rows back.
    ///
    /// # Errors
    ///
    /// Propagates imprinting errors.
    pub fn imprint<B: AutodiffBackend>(
        &self,
        model: &mut ImprintedRfb<B>,
        loader: &EpisodeLoader,
        priors: &[Prior],
    ) -> Result<ImprintReport> {
        let n_classes = loader.shots().num_classes();
        let mut inner = model.valid();
        let report = ImprintingEngine::from_config(&self.config)
            .with_variance(self.model.priors.variance)
            .imprint(
                &mut inner,
                |stage| Ok(loader.episodes(&self.support_sampler(n_classes, stage)?)),
                priors,
            )?;
        for stage in Stage::ALL {
            model.set_classifier_weights(stage, Tensor::from_inner(inner.classifier_weights(stage)))?;
        }
        model.reset_stage_scales();
        Ok(report)
    }

    /// Fine-tunes `model` from `start_iter` to `max_iter`.
    ///
    /// # Errors
    ///
    /// Returns an error if an episode stream runs short, a loss cannot be
    /// computed or a checkpoint cannot be written.
    #[allow(clippy::too_many_lines)]
    pub fn fine_tune<B: AutodiffBackend>(
        &self,
        mut model: ImprintedRfb<B>,
        loader: &EpisodeLoader,
        priors: &[Prior],
        strategy: &ExecutionStrategy<B>,
    ) -> Result<(ImprintedRfb<B>, TrainingState)> {
        let config = &self.config;
        let epoch_size = config.epoch_size();
        let (start, end) = (config.start_iter(), config.max_iter());
        let variance = self.model.priors.variance;

        let sgd = &config.optimizer;
        let momentum = (sgd.momentum > 0.0)
            .then(|| MomentumConfig::new().with_momentum(sgd.momentum).with_dampening(0.0));
        #[allow(clippy::cast_possible_truncation)]
        let decay = (sgd.weight_decay > 0.0).then(|| WeightDecayConfig::new(sgd.weight_decay as f32));
        let mut optimizer = SgdConfig::new()
            .with_momentum(momentum)
            .with_weight_decay(decay)
            .init::<B, ImprintedRfb<B>>();

        let mut logger = if config.log {
            Some(ScalarLogger::create(&config.save_folder.join("logs"))?)
        } else {
            None
        };
        let sampler = self.train_sampler(loader.shots().num_classes())?;
        let mut state = TrainingState::from_config(config);
        let mut targets = TargetBatch::new(config.batch_size, priors.len());
        let mut episodes: Option<EpisodeStream> = None;
        let mut lr = self.compute_lr(state.epoch);
        let mut epoch_timer = Instant::now();
        let mut log_timer = Instant::now();

        info!(
            start,
            end,
            epoch_size,
            devices = strategy.num_devices(),
            "Fine-tuning on {}-shot task",
            config.n_shot_task
        );
        for iteration in start..end {
            if iteration % epoch_size == 0 {
                if iteration != start {
                    self.finish_epoch(&mut state, &model, lr, epoch_timer.elapsed(), true)?;
                }
                let epoch = iteration / epoch_size;
                lr = self.compute_lr(epoch);
                episodes = Some(loader.episodes(&sampler.for_epoch(epoch)));
                epoch_timer = Instant::now();
                debug!(epoch, lr, "Starting epoch");
            }

            let batch = episodes.as_mut().and_then(Iterator::next).ok_or(
                TrainingError::EpisodesExhausted {
                    expected: epoch_size,
                    delivered: iteration % epoch_size,
                },
            )??;
            targets.match_batch(config.jaccard_threshold, &batch.targets, priors, variance);

            let step = strategy.backward(&model, &batch, &targets, &self.criterion)?;
            for group in step.groups {
                if group.grads.is_empty() {
                    continue;
                }
                model = optimizer.step(lr * group.lr_factor, model, group.grads);
            }
            model.normalize();

            let losses = step.losses;
            if !losses.is_finite() {
                warn!(
                    iteration,
                    loc = losses.loc,
                    conf = losses.conf,
                    obj = losses.obj,
                    "Non-finite loss"
                );
            }
            state.record_iteration(losses);

            if iteration % config.log_every == 0 && iteration != start {
                info!(
                    epoch = state.epoch + 1,
                    epoch_iter = iteration % epoch_size,
                    epoch_size,
                    iteration,
                    loc = losses.loc,
                    conf = losses.conf,
                    obj = losses.obj,
                    secs = log_timer.elapsed().as_secs_f32(),
                    lr_base = lr * BASE_LR_FACTOR,
                    lr,
                    "Fine-tuning"
                );
                if let Some(logger) = logger.as_mut() {
                    logger.iteration(&losses, lr, iteration)?;
                }
                log_timer = Instant::now();
            }
        }
        if state.epoch_iterations() > 0 {
            self.finish_epoch(&mut state, &model, lr, epoch_timer.elapsed(), false)?;
        }
        if let Some(logger) = logger.as_mut() {
            logger.flush()?;
        }
        Ok((model, state))
    }

    fn finish_epoch<B: Backend>(
        &self,
        state: &mut TrainingState,
        model: &ImprintedRfb<B>,
        lr: f64,
        elapsed: Duration,
        checkpoint: bool,
    ) -> Result<()> {
        let metrics = state.next_epoch(lr, elapsed.as_secs_f32());
        info!(
            epoch = state.epoch,
            loc = metrics.losses.loc,
            conf = metrics.losses.conf,
            obj = metrics.losses.obj,
            secs = metrics.train_time_secs,
            "Epoch {} finished",
            state.epoch
        );
        if metrics.non_finite > 0 {
            warn!(epoch = state.epoch, count = metrics.non_finite, "Epoch had non-finite losses");
        }
        if checkpoint && self.config.should_checkpoint(state.epoch) {
            let path = self.save_checkpoint(model, &self.config.epoch_checkpoint_stem(state.epoch))?;
            state.metrics.add_checkpoint(path);
        }
        Ok(())
    }

    /// Writes `model`'s state dict to `stem` plus the configured extension.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the file cannot be written.
    pub fn save_checkpoint<B: Backend>(&self, model: &ImprintedRfb<B>, stem: &Path) -> Result<PathBuf> {
        let path = model.state_dict()?.save(stem, self.config.checkpoint_format)?;
        info!(path = %path.display(), "Saved checkpoint");
        Ok(path)
    }

    /// Builds, imprints and fine-tunes a network, then writes the final
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates errors from every phase.
    pub fn run<B: AutodiffBackend>(
        &self,
        loader: &EpisodeLoader,
        strategy: &ExecutionStrategy<B>,
    ) -> Result<TrainingOutcome<B>> {
        self.config.ensure_save_folder()?;
        let priors = self.priors()?;
        let mut model = self.build_model::<B>(strategy.main_device())?;

        info!(
            version = %self.config.version,
            dataset = %self.config.dataset,
            priors = priors.len(),
            "Imprinting classifier"
        );
        let imprint = self.imprint(&mut model, loader, &priors)?;
        let (model, mut state) = self.fine_tune(model, loader, &priors, strategy)?;

        let final_checkpoint = self.save_checkpoint(&model, &self.config.final_checkpoint_stem())?;
        state.metrics.add_checkpoint(final_checkpoint.clone());
        Ok(TrainingOutcome {
            model,
            imprint,
            state,
            final_checkpoint,
        })
    }
}
