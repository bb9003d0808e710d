//! Named state-dict checkpoints.
//!
//! A checkpoint is an ordered map from parameter path (`"base.0.weight"`,
//! `"denselayer2.fc.weight"`, ...) to a flat `f32` tensor with its shape.
//! Loading is deliberately lenient: a leading `module.` (written by
//! data-parallel wrappers) is stripped, missing or unknown keys are reported
//! rather than rejected, and entries whose shape disagrees with the model are
//! skipped.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use burn::module::Param;
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ModelError, Result};

/// Key prefix added by data-parallel wrappers.
pub const PARALLEL_PREFIX: &str = "module.";

/// Supported checkpoint file formats.
///
/// # Example
///
/// ```
/// use fsdet_models::CheckpointFormat;
///
/// let format = CheckpointFormat::from_extension("bin");
/// assert_eq!(format, Some(CheckpointFormat::Binary));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointFormat {
    /// Compact `bincode` encoding.
    #[default]
    Binary,

    /// Human-readable JSON, for inspection.
    Json,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.bin`, `.pth` -> Binary
    /// - `.json` -> Json
    /// - Other -> None
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "bin" | "pth" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Determines format from file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Returns the default file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One stored tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    /// Tensor dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub values: Vec<f32>,
}

impl TensorEntry {
    /// Reads a tensor back to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] if the backend data cannot be
    /// read back as `f32`.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<Self> {
        let data = tensor.to_data().convert::<f32>();
        let shape = data.shape.clone();
        let values = data
            .to_vec::<f32>()
            .map_err(|e| ModelError::invalid_config(format!("tensor readback: {e:?}")))?;
        Ok(Self { shape, values })
    }

    /// Builds a tensor on `device`, or `None` if the rank differs.
    #[must_use]
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Option<Tensor<B, D>> {
        if self.shape.len() != D || self.shape.iter().product::<usize>() != self.values.len() {
            return None;
        }
        Some(Tensor::from_data(
            TensorData::new(self.values.clone(), self.shape.clone()),
            device,
        ))
    }
}

/// Outcome of a lenient load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Keys restored.
    pub loaded: Vec<String>,
    /// Model keys absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint keys the model does not have.
    pub unexpected: Vec<String>,
    /// Keys present on both sides with different shapes.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    /// Returns `true` if every model key was restored and nothing was left over.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    /// Logs the report.
    pub fn log(&self, source: &str) {
        debug!(source, loaded = self.loaded.len(), "Restored parameters");
        if !self.missing.is_empty() {
            warn!(source, missing = ?self.missing, "Parameters missing from checkpoint");
        }
        if !self.unexpected.is_empty() {
            warn!(source, unexpected = ?self.unexpected, "Ignoring unknown checkpoint keys");
        }
        if !self.mismatched.is_empty() {
            warn!(source, mismatched = ?self.mismatched, "Skipping parameters with mismatched shapes");
        }
    }
}

/// Ordered parameter-path to tensor map.
///
/// # Example
///
/// ```
/// use fsdet_models::{StateDict, TensorEntry};
///
/// let mut dict = StateDict::new();
/// dict.insert("module.scale", TensorEntry { shape: vec![1], values: vec![10.0] });
///
/// let dict = dict.strip_prefix("module.");
/// assert!(dict.get("scale").is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    entries: BTreeMap<String, TensorEntry>,
}

impl StateDict {
    /// Creates an empty dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, entry: TensorEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Stores `tensor` under `key`.
    ///
    /// # Errors
    ///
    /// Propagates [`TensorEntry::from_tensor`] errors.
    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        key: impl Into<String>,
        tensor: &Tensor<B, D>,
    ) -> Result<()> {
        self.insert(key, TensorEntry::from_tensor(tensor)?);
        Ok(())
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TensorEntry> {
        self.entries.get(key)
    }

    /// Iterates keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the dict has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes `prefix` from every key that starts with it.
    #[must_use]
    pub fn strip_prefix(self, prefix: &str) -> Self {
        let entries = self
            .entries
            .into_iter()
            .map(|(key, entry)| {
                if key.starts_with(prefix) {
                    (key[prefix.len()..].to_string(), entry)
                } else {
                    (key, entry)
                }
            })
            .collect();
        Self { entries }
    }

    /// Keeps only keys under `prefix`, with the prefix removed.
    #[must_use]
    pub fn subtree(&self, prefix: &str) -> Self {
        let entries = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                key.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), entry.clone()))
            })
            .collect();
        Self { entries }
    }

    /// Writes the dict to `stem` plus the format's extension.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::SaveCheckpoint`] on I/O or encoding failure.
    pub fn save(&self, stem: &Path, format: CheckpointFormat) -> Result<PathBuf> {
        let path = stem.with_extension(format.extension());
        let shown = path.display().to_string();
        let file = File::create(&path).map_err(|e| ModelError::save_checkpoint(&shown, e.to_string()))?;
        let writer = BufWriter::new(file);
        match format {
            CheckpointFormat::Binary => bincode::serialize_into(writer, self)
                .map_err(|e| ModelError::save_checkpoint(&shown, e.to_string()))?,
            CheckpointFormat::Json => serde_json::to_writer(writer, self)
                .map_err(|e| ModelError::save_checkpoint(&shown, e.to_string()))?,
        }
        debug!(path = %shown, entries = self.len(), "Saved checkpoint");
        Ok(path)
    }

    /// Reads a dict, stripping the data-parallel key prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::CheckpointNotFound`] if the file does not exist,
    /// [`ModelError::UnsupportedFormat`] for an unknown extension and
    /// [`ModelError::LoadCheckpoint`] when decoding fails.
    pub fn load(path: &Path) -> Result<Self> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ModelError::checkpoint_not_found(&shown));
        }
        let format =
            CheckpointFormat::from_path(path).ok_or_else(|| ModelError::unsupported_format(&shown))?;
        let file = File::open(path).map_err(|e| ModelError::load_checkpoint(&shown, e.to_string()))?;
        let reader = BufReader::new(file);
        let dict: Self = match format {
            CheckpointFormat::Binary => bincode::deserialize_from(reader)
                .map_err(|e| ModelError::load_checkpoint(&shown, e.to_string()))?,
            CheckpointFormat::Json => serde_json::from_reader(reader)
                .map_err(|e| ModelError::load_checkpoint(&shown, e.to_string()))?,
        };
        Ok(dict.strip_prefix(PARALLEL_PREFIX))
    }
}

/// Restores a parameter from `dict[key]`, recording the outcome.
///
/// The parameter keeps its identity so optimizer state stays attached.
pub(crate) fn restore_param<B: Backend, const D: usize>(
    param: Param<Tensor<B, D>>,
    key: &str,
    dict: &StateDict,
    report: &mut LoadReport,
) -> Param<Tensor<B, D>> {
    match restore_tensor(&param.val(), key, dict, report) {
        Some(tensor) => Param::initialized(param.id, tensor.require_grad()),
        None => param,
    }
}

/// Builds the replacement for `current` from `dict[key]`, recording the outcome.
pub(crate) fn restore_tensor<B: Backend, const D: usize>(
    current: &Tensor<B, D>,
    key: &str,
    dict: &StateDict,
    report: &mut LoadReport,
) -> Option<Tensor<B, D>> {
    let Some(entry) = dict.get(key) else {
        report.missing.push(key.to_string());
        return None;
    };
    if entry.shape != current.dims() {
        report.mismatched.push(key.to_string());
        return None;
    }
    let tensor = entry.to_tensor::<B, D>(&current.device());
    match tensor {
        Some(tensor) => {
            report.loaded.push(key.to_string());
            Some(tensor)
        }
        None => {
            report.mismatched.push(key.to_string());
            None
        }
    }
}

/// Records every dict key the model did not consume as unexpected.
pub(crate) fn finish_report(dict: &StateDict, report: &mut LoadReport) {
    let known: std::collections::BTreeSet<&str> = report
        .loaded
        .iter()
        .chain(&report.missing)
        .chain(&report.mismatched)
        .map(String::as_str)
        .collect();
    report.unexpected = dict
        .keys()
        .filter(|key| !known.contains(key))
        .map(str::to_string)
        .collect();
}
