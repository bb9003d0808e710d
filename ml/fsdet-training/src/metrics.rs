//! Training metrics and scalar logging.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};
use crate::loss::LossValues;

/// Metrics for a single fine-tuning epoch.
///
/// # Example
///
/// ```
/// use fsdet_training::{EpochMetrics, LossValues};
///
/// let metrics = EpochMetrics::new(0, LossValues::new(1.0, 2.0, 3.0), 100);
/// assert_eq!(metrics.epoch, 0);
/// assert!((metrics.losses.obj - 0.03).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Epoch number (0-indexed).
    pub epoch: usize,

    /// Mean loss components over the epoch's iterations.
    pub losses: LossValues,

    /// Iterations run.
    pub iterations: usize,

    /// Base learning rate used.
    pub learning_rate: f64,

    /// Wall time in seconds.
    pub train_time_secs: f32,

    /// Iterations whose loss was not finite.
    #[serde(default)]
    pub non_finite: usize,
}

impl EpochMetrics {
    /// Creates epoch metrics from summed losses.
    #[must_use]
    pub fn new(epoch: usize, summed: LossValues, iterations: usize) -> Self {
        Self {
            epoch,
            losses: summed.averaged(iterations),
            iterations,
            learning_rate: 0.0,
            train_time_secs: 0.0,
            non_finite: 0,
        }
    }

    /// Sets the learning rate.
    #[must_use]
    pub const fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Sets the training time.
    #[must_use]
    pub const fn with_train_time(mut self, secs: f32) -> Self {
        self.train_time_secs = secs;
        self
    }

    /// Sets the number of non-finite iterations.
    #[must_use]
    pub const fn with_non_finite(mut self, count: usize) -> Self {
        self.non_finite = count;
        self
    }

    /// Mean total loss.
    #[must_use]
    pub fn total_loss(&self) -> f32 {
        self.losses.total()
    }
}

/// Aggregate metrics for a fine-tuning run.
///
/// # Example
///
/// ```
/// use fsdet_training::{EpochMetrics, LossValues, TrainingMetrics};
///
/// let mut metrics = TrainingMetrics::new();
/// metrics.add_epoch(EpochMetrics::new(0, LossValues::new(1.0, 1.0, 1.0), 1));
/// metrics.add_epoch(EpochMetrics::new(1, LossValues::new(0.5, 0.5, 0.5), 1));
///
/// assert_eq!(metrics.epochs_completed(), 2);
/// assert!((metrics.final_loss() - 1.5).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Metrics for each epoch.
    pub epoch_metrics: Vec<EpochMetrics>,

    /// Total training time in seconds.
    pub total_time_secs: f32,

    /// Checkpoints written, in order.
    #[serde(default)]
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingMetrics {
    /// Creates new empty training metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds metrics for an epoch.
    pub fn add_epoch(&mut self, metrics: EpochMetrics) {
        self.total_time_secs += metrics.train_time_secs;
        self.epoch_metrics.push(metrics);
    }

    /// Records a written checkpoint.
    pub fn add_checkpoint(&mut self, path: PathBuf) {
        self.checkpoints.push(path);
    }

    /// Returns the number of completed epochs.
    #[must_use]
    pub fn epochs_completed(&self) -> usize {
        self.epoch_metrics.len()
    }

    /// Returns the final mean total loss.
    #[must_use]
    pub fn final_loss(&self) -> f32 {
        self.epoch_metrics.last().map_or(f32::NAN, EpochMetrics::total_loss)
    }

    /// Returns the first mean total loss.
    #[must_use]
    pub fn initial_loss(&self) -> f32 {
        self.epoch_metrics
            .first()
            .map_or(f32::NAN, EpochMetrics::total_loss)
    }

    /// Returns the loss improvement ratio.
    #[must_use]
    pub fn loss_improvement(&self) -> f32 {
        let initial = self.initial_loss();
        let final_loss = self.final_loss();
        if initial > 0.0 && !initial.is_nan() && !final_loss.is_nan() {
            1.0 - (final_loss / initial)
        } else {
            0.0
        }
    }

    /// Returns mean total losses per epoch.
    #[must_use]
    pub fn train_losses(&self) -> Vec<f32> {
        self.epoch_metrics.iter().map(EpochMetrics::total_loss).collect()
    }

    /// Returns learning rates per epoch.
    #[must_use]
    pub fn learning_rates(&self) -> Vec<f64> {
        self.epoch_metrics.iter().map(|m| m.learning_rate).collect()
    }

    /// Returns a human-readable summary.
    #[must_use]
    #[allow(clippy::let_underscore_must_use)] // String::write_fmt is infallible
    pub fn summary(&self) -> String {
        use std::fmt::Write;

        let mut s = String::new();
        let _ = writeln!(s, "Fine-tuning Summary");
        let _ = writeln!(s, "===================");
        let _ = writeln!(s, "Epochs completed: {}", self.epochs_completed());
        let _ = writeln!(s, "Total time: {:.1}s", self.total_time_secs);
        if let Some(last) = self.epoch_metrics.last() {
            let _ = writeln!(
                s,
                "Final epoch: L: {:.4} C: {:.4} O: {:.4}",
                last.losses.loc, last.losses.conf, last.losses.obj
            );
        }
        let _ = writeln!(
            s,
            "Initial loss: {:.4} -> Final loss: {:.4}",
            self.initial_loss(),
            self.final_loss()
        );
        let _ = writeln!(s, "Improvement: {:.1}%", self.loss_improvement() * 100.0);
        let _ = writeln!(s, "Checkpoints: {}", self.checkpoints.len());
        s
    }
}

/// One scalar summary record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Series name.
    pub tag: String,
    /// Value.
    pub value: f64,
    /// Global iteration.
    pub step: usize,
}

/// Appends scalar summaries as JSON lines.
#[derive(Debug)]
pub struct ScalarLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarLogger {
    /// File name inside the log directory.
    pub const FILE_NAME: &'static str = "scalars.jsonl";

    /// Creates `dir` if needed and opens the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TrainingError::Io`] if the directory or file cannot be
    /// created.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one scalar.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the record cannot be written.
    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Writes the loss components and learning rate of one iteration.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a record cannot be written.
    pub fn iteration(&mut self, losses: &LossValues, lr: f64, step: usize) -> Result<()> {
        self.scalar("loc_loss", f64::from(losses.loc), step)?;
        self.scalar("conf_loss", f64::from(losses.conf), step)?;
        self.scalar("obj_loss", f64::from(losses.obj), step)?;
        self.scalar("lr", lr, step)?;
        self.flush()
    }

    /// Flushes buffered records.
    ///
    /// # Errors
    ///
    /// Returns an IO error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads every record of a scalar log.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read or a line is malformed.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarRecord>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TrainingError::from))
        .collect()
}
