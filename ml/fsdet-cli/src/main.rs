//! Few-shot RFB detector training by weight imprinting.
//!
//! Builds the network, imprints its three classifier stages from support
//! episodes and fine-tunes it episodically.
//!
//! # Usage
//!
//! - `train-imprinted -v RFB_vgg -s 300 -d VOC --n_shot_task 5`
//! - `train-imprinted --samples train.json --basenet weights/vgg16.bin`
//! - `train-imprinted --resume_net weights/RFB_vgg_VOC_imprinted_epoches_10.bin --resume_epoch 10`
//!
//! Without `--samples` a synthetic dataset with one class per classifier row
//! is used.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use clap::Parser;
use fsdet_dataset::{
    DetectionDataset, DetectionSample, EpisodeLoader, InMemoryDataset, ShotIndex, SyntheticConfig,
    SyntheticDataset,
};
use fsdet_models::{Architecture, CheckpointFormat, DatasetKind};
use fsdet_training::{
    ExecutionStrategy, LearningRateSchedule, OptimizerConfig, Trainer, TrainingConfig,
    ZeroPositivePolicy,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

type TrainBackend = Autodiff<NdArray<f32>>;

/// Receptive Field Block detector training with weight imprinting
#[derive(Parser, Debug)]
#[command(name = "train-imprinted")]
#[command(about = "Imprint and fine-tune a few-shot RFB detector", long_about = None)]
#[command(version)]
struct Cli {
    /// Network variant: RFB_vgg, RFB_E_vgg or RFB_mobile
    #[arg(short = 'v', long, default_value = "RFB_vgg")]
    version: Architecture,

    /// Input size: 300 or 512
    #[arg(short = 's', long, default_value_t = 300)]
    size: u32,

    /// Dataset family: VOC or COCO
    #[arg(short = 'd', long, default_value = "VOC")]
    dataset: DatasetKind,

    /// Pretrained base network weights
    #[arg(long)]
    basenet: Option<PathBuf>,

    /// Minimum IoU for matching priors
    #[arg(long = "jaccard_threshold", default_value_t = 0.5)]
    jaccard_threshold: f32,

    /// Class slots per episode
    #[arg(short = 'b', long = "batch_size", default_value_t = 64)]
    batch_size: usize,

    /// Support images per class
    #[arg(long = "n_shot_task", default_value_t = 5)]
    n_shot_task: usize,

    /// Episodes per imprinting stage
    #[arg(long = "support_episodes", default_value_t = 50)]
    support_episodes: usize,

    /// Episodes per fine-tuning epoch
    #[arg(long = "train_episodes", default_value_t = 100)]
    train_episodes: usize,

    /// Episode loading threads
    #[arg(long = "num_workers", default_value_t = 4)]
    num_workers: usize,

    /// Replicas each batch is split over
    #[arg(long, default_value_t = 1)]
    ngpu: usize,

    /// Initial learning rate
    #[arg(long = "lr", visible_alias = "learning-rate", default_value_t = 4e-3)]
    lr: f64,

    /// SGD momentum
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,

    /// Weight decay
    #[arg(long = "weight_decay", default_value_t = 5e-4)]
    weight_decay: f64,

    /// Learning rate decay per milestone
    #[arg(long, default_value_t = 0.1)]
    gamma: f64,

    /// Checkpoint to resume from
    #[arg(long = "resume_net")]
    resume_net: Option<PathBuf>,

    /// Epochs completed by the resumed checkpoint
    #[arg(long = "resume_epoch", default_value_t = 0)]
    resume_epoch: usize,

    /// Total fine-tuning epochs
    #[arg(long = "max_epoch", visible_alias = "max", default_value_t = 40)]
    max_epoch: usize,

    /// Write scalar logs under the save folder
    #[arg(long)]
    log: bool,

    /// Directory for checkpoints
    #[arg(long = "save_folder", default_value = "./weights/")]
    save_folder: PathBuf,

    /// Embedding width per prior
    #[arg(long = "feature_dim", default_value_t = 60)]
    feature_dim: usize,

    /// Classifier rows
    #[arg(long = "n_way", default_value_t = 20)]
    n_way: usize,

    /// Epochs between intermediate checkpoints
    #[arg(long = "checkpoint_every", default_value_t = 2)]
    checkpoint_every: usize,

    /// Fail when a class gets no positive prior during imprinting
    #[arg(long = "strict_imprint")]
    strict_imprint: bool,

    /// Write checkpoints as JSON instead of bincode
    #[arg(long = "json_checkpoints")]
    json_checkpoints: bool,

    /// Seed for shot selection and episode sampling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// JSON array of samples; a synthetic dataset is used when omitted
    #[arg(long)]
    samples: Option<PathBuf>,

    /// Samples per class for the synthetic dataset
    #[arg(long = "synthetic_per_class", default_value_t = 10)]
    synthetic_per_class: usize,
}

impl Cli {
    fn training_config(&self) -> TrainingConfig {
        let mut config = TrainingConfig::new(self.dataset)
            .with_version(self.version)
            .with_size(self.size)
            .with_batch_size(self.batch_size)
            .with_n_shot_task(self.n_shot_task)
            .with_episodes(self.support_episodes, self.train_episodes)
            .with_num_workers(self.num_workers)
            .with_ngpu(self.ngpu)
            .with_optimizer(
                OptimizerConfig::sgd_momentum(self.lr, self.momentum)
                    .with_weight_decay(self.weight_decay),
            )
            .with_lr_schedule(LearningRateSchedule::for_dataset(self.dataset, self.gamma))
            .with_max_epoch(self.max_epoch)
            .with_save_folder(&self.save_folder)
            .with_classifier(self.feature_dim, self.n_way)
            .with_log(self.log)
            .with_seed(self.seed);
        config.jaccard_threshold = self.jaccard_threshold;
        config.checkpoint_every = self.checkpoint_every;
        if let Some(path) = &self.basenet {
            config = config.with_basenet(path);
        }
        if let Some(path) = &self.resume_net {
            config = config.with_resume(path, self.resume_epoch);
        } else {
            config.resume_epoch = self.resume_epoch;
        }
        if self.strict_imprint {
            config = config.with_zero_positive(ZeroPositivePolicy::Fail);
        }
        if self.json_checkpoints {
            config = config.with_checkpoint_format(CheckpointFormat::Json);
        }
        config
    }

    fn dataset(&self) -> Result<Arc<dyn DetectionDataset>> {
        if let Some(path) = &self.samples {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading samples from {}", path.display()))?;
            let samples: Vec<DetectionSample> = serde_json::from_str(&text)
                .with_context(|| format!("parsing samples in {}", path.display()))?;
            info!(path = %path.display(), samples = samples.len(), "Loaded samples");
            return Ok(Arc::new(InMemoryDataset::new(samples, self.n_way)));
        }
        let config = SyntheticConfig::default()
            .with_num_classes(self.n_way)
            .with_samples_per_class(self.synthetic_per_class)
            .with_image_size(self.size)
            .with_seed(self.seed);
        info!(classes = self.n_way, per_class = self.synthetic_per_class, "Using synthetic data");
        Ok(Arc::new(SyntheticDataset::new(config)))
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let cli = Cli::parse();
    let trainer = Trainer::new(cli.training_config()).context("invalid training configuration")?;

    let dataset = cli.dataset()?;
    let shots = ShotIndex::build(dataset.as_ref(), cli.n_shot_task, cli.seed)?;
    info!(
        classes = shots.num_classes(),
        n_shot = cli.n_shot_task,
        "Built support set"
    );
    let loader = EpisodeLoader::new(dataset, Arc::new(shots), cli.num_workers);

    let strategy = ExecutionStrategy::<TrainBackend>::replicated(&Default::default(), cli.ngpu)?;
    let outcome = trainer.run(&loader, &strategy)?;

    info!(
        path = %outcome.final_checkpoint.display(),
        "{}",
        outcome.state.metrics.summary()
    );
    Ok(())
}
