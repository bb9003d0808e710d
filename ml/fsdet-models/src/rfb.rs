//! Imprintable single-shot RFB-style detector.
//!
//! Architecture: a strided convolutional base, one adaptive-pooled source
//! per prior feature map (each refined by an extra 3×3 layer), and per-source
//! 3×3 heads for box offsets, prior embeddings and objectness. Embeddings
//! are scored by the three cascaded [`DenseLayer`] stages and multiplied by a
//! learnable cosine scale.

use std::f64::consts::SQRT_2;
use std::fmt;
use std::str::FromStr;

use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::optim::GradientsParams;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::module::adaptive_avg_pool2d;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{LoadReport, StateDict, finish_report, restore_param, restore_tensor};
use crate::denselayer::{DenseLayer, Stage};
use crate::error::{ModelError, Result};
use crate::network::{DetectionNetwork, DetectionOutput, GradientGroup, GradientGroups};
use crate::prior::{PriorBoxConfig, PriorPreset};

/// Dataset family; selects the prior layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Pascal VOC.
    #[default]
    Voc,
    /// MS COCO.
    Coco,
}

impl DatasetKind {
    /// Returns the selector string.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Voc => "VOC",
            Self::Coco => "COCO",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VOC" => Ok(Self::Voc),
            "COCO" => Ok(Self::Coco),
            other => Err(ModelError::invalid_config(format!("unknown dataset: {other}"))),
        }
    }
}

/// Network variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Architecture {
    /// VGG-style base.
    #[default]
    RfbVgg,
    /// VGG-style base with a lateral reduce layer on the finest source.
    RfbEVgg,
    /// Lightweight base with a coarser first source.
    RfbMobile,
}

impl Architecture {
    /// Returns the selector string.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RfbVgg => "RFB_vgg",
            Self::RfbEVgg => "RFB_E_vgg",
            Self::RfbMobile => "RFB_mobile",
        }
    }

    /// Base channel widths; every base layer halves the resolution.
    #[must_use]
    pub fn default_base_channels(&self) -> Vec<usize> {
        match self {
            Self::RfbVgg | Self::RfbEVgg => vec![64, 128, 256],
            Self::RfbMobile => vec![32, 64, 128, 256],
        }
    }

    /// Picks the prior layout for a dataset and input size.
    ///
    /// The mobile variant always uses `COCO_mobile_300`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for sizes other than 300 and 512.
    pub fn prior_preset(&self, dataset: DatasetKind, size: u32) -> Result<PriorPreset> {
        if *self == Self::RfbMobile {
            return Ok(PriorPreset::CocoMobile300);
        }
        match (dataset, size) {
            (DatasetKind::Voc, 300) => Ok(PriorPreset::Voc300),
            (DatasetKind::Voc, 512) => Ok(PriorPreset::Voc512),
            (DatasetKind::Coco, 300) => Ok(PriorPreset::Coco300),
            (DatasetKind::Coco, 512) => Ok(PriorPreset::Coco512),
            (_, other) => Err(ModelError::invalid_config(format!(
                "unsupported input size {other}: expected 300 or 512"
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RFB_vgg" => Ok(Self::RfbVgg),
            "RFB_E_vgg" => Ok(Self::RfbEVgg),
            "RFB_mobile" => Ok(Self::RfbMobile),
            other => Err(ModelError::UnknownArchitecture(other.to_string())),
        }
    }
}

/// Configuration for [`ImprintedRfb`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfbConfig {
    /// Network variant.
    pub architecture: Architecture,
    /// Prior layout the heads must agree with.
    pub priors: PriorBoxConfig,
    /// Image channels.
    pub in_channels: usize,
    /// Output width of every base layer.
    pub base_channels: Vec<usize>,
    /// Width of every source map.
    pub source_channels: usize,
    /// Embedding width per prior.
    pub feature_dim: usize,
    /// Number of classes scored.
    pub n_way: usize,
    /// Initial cosine scale.
    pub scale: f32,
}

impl RfbConfig {
    /// Creates a configuration with the variant's default widths.
    #[must_use]
    pub fn new(architecture: Architecture, priors: PriorBoxConfig) -> Self {
        Self {
            architecture,
            priors,
            in_channels: 3,
            base_channels: architecture.default_base_channels(),
            source_channels: 128,
            feature_dim: 60,
            n_way: 20,
            scale: 10.0,
        }
    }

    /// Creates a configuration from the command-line selectors.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for an unsupported input size.
    pub fn for_selection(architecture: Architecture, dataset: DatasetKind, size: u32) -> Result<Self> {
        let preset = architecture.prior_preset(dataset, size)?;
        Ok(Self::new(architecture, PriorBoxConfig::preset(preset)))
    }

    /// Sets the base widths.
    #[must_use]
    pub fn with_base_channels(mut self, channels: Vec<usize>) -> Self {
        self.base_channels = channels;
        self
    }

    /// Sets the source width.
    #[must_use]
    pub const fn with_source_channels(mut self, channels: usize) -> Self {
        self.source_channels = channels;
        self
    }

    /// Sets the embedding width.
    #[must_use]
    pub const fn with_feature_dim(mut self, feature_dim: usize) -> Self {
        self.feature_dim = feature_dim;
        self
    }

    /// Sets the class count.
    #[must_use]
    pub const fn with_n_way(mut self, n_way: usize) -> Self {
        self.n_way = n_way;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        self.priors.validate()?;
        if self.in_channels == 0 || self.source_channels == 0 {
            return Err(ModelError::invalid_config("channel counts must be positive"));
        }
        if self.base_channels.is_empty() || self.base_channels.contains(&0) {
            return Err(ModelError::invalid_config(
                "base needs at least one layer of positive width",
            ));
        }
        if self.feature_dim == 0 || self.n_way == 0 {
            return Err(ModelError::invalid_config(
                "feature_dim and n_way must be positive",
            ));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(ModelError::invalid_config("scale must be positive"));
        }
        Ok(())
    }

    /// Builds the network.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] if validation fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ImprintedRfb<B>> {
        self.validate()?;
        let mut base = Vec::with_capacity(self.base_channels.len());
        let mut channels = self.in_channels;
        for &width in &self.base_channels {
            base.push(conv(channels, width, 3, 2, device));
            channels = width;
        }

        let sources = self.priors.num_sources();
        let anchors: Vec<usize> = (0..sources).map(|k| self.priors.anchors_per_cell(k)).collect();
        let head = |per_anchor: usize| -> Vec<Conv2d<B>> {
            anchors
                .iter()
                .map(|&a| conv(self.source_channels, a * per_anchor, 3, 1, device))
                .collect()
        };

        let reduce = (self.architecture == Architecture::RfbEVgg)
            .then(|| conv(self.source_channels, self.source_channels, 1, 1, device));

        let network = ImprintedRfb {
            extras: (0..sources)
                .map(|_| conv(channels, self.source_channels, 3, 1, device))
                .collect(),
            base,
            reduce,
            loc: head(4),
            conf: head(self.feature_dim),
            obj: head(2),
            denselayer1: DenseLayer::new(Stage::First, self.feature_dim, self.n_way, device),
            denselayer2: DenseLayer::new(Stage::Second, self.feature_dim, self.n_way, device),
            denselayer3: DenseLayer::new(Stage::Third, self.feature_dim, self.n_way, device),
            scale: Param::from_tensor(Tensor::full([1], self.scale, device)),
            feature_maps: self.priors.feature_maps.clone(),
            anchors,
            n_way: self.n_way,
            feature_dim: self.feature_dim,
            num_priors: self.priors.num_priors(),
        };
        debug!(
            architecture = %self.architecture,
            priors = network.num_priors,
            n_way = self.n_way,
            "Built network"
        );
        Ok(network)
    }
}

fn conv<B: Backend>(
    input: usize,
    output: usize,
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    let mut layer = Conv2dConfig::new([input, output], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        })
        .init(device);
    layer.bias = Some(Param::from_tensor(Tensor::zeros([output], device)));
    layer
}

/// `[N, A * width, H, W]` head output to `[N, H * W * A, width]`.
fn flatten_head<B: Backend>(x: Tensor<B, 4>, width: usize) -> Tensor<B, 3> {
    let [n, c, h, w] = x.dims();
    x.permute([0, 2, 3, 1]).reshape([n, h * w * (c / width), width])
}

/// RFB-style detector with a cascaded imprintable classifier.
#[derive(Module, Debug)]
pub struct ImprintedRfb<B: Backend> {
    base: Vec<Conv2d<B>>,
    reduce: Option<Conv2d<B>>,
    extras: Vec<Conv2d<B>>,
    loc: Vec<Conv2d<B>>,
    conf: Vec<Conv2d<B>>,
    obj: Vec<Conv2d<B>>,
    denselayer1: DenseLayer<B>,
    denselayer2: DenseLayer<B>,
    denselayer3: DenseLayer<B>,
    scale: Param<Tensor<B, 1>>,
    feature_maps: Vec<usize>,
    anchors: Vec<usize>,
    n_way: usize,
    feature_dim: usize,
    num_priors: usize,
}

impl<B: Backend> ImprintedRfb<B> {
    fn sources(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = images;
        for layer in &self.base {
            x = relu(layer.forward(x));
        }
        self.extras
            .iter()
            .zip(&self.feature_maps)
            .enumerate()
            .map(|(k, (layer, &size))| {
                let source = relu(layer.forward(adaptive_avg_pool2d(x.clone(), [size, size])));
                match (&self.reduce, k) {
                    (Some(reduce), 0) => source.clone() + relu(reduce.forward(source)),
                    _ => source,
                }
            })
            .collect()
    }

    fn head(heads: &[Conv2d<B>], sources: &[Tensor<B, 4>], width: usize) -> Tensor<B, 3> {
        let parts = heads
            .iter()
            .zip(sources)
            .map(|(head, source)| flatten_head(head.forward(source.clone()), width))
            .collect();
        Tensor::cat(parts, 1)
    }

    /// Cosine scale applied to the last stage.
    #[must_use]
    pub fn scale(&self) -> Tensor<B, 1> {
        self.scale.val()
    }

    /// Source feature-map sides.
    #[must_use]
    pub fn feature_maps(&self) -> &[usize] {
        &self.feature_maps
    }

    /// Collects every parameter and running statistic under its path.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be read back.
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut dict = StateDict::new();
        let groups: [(&str, &[Conv2d<B>]); 5] = [
            ("base", &self.base),
            ("extras", &self.extras),
            ("loc", &self.loc),
            ("conf", &self.conf),
            ("obj", &self.obj),
        ];
        for (prefix, layers) in groups {
            for (i, layer) in layers.iter().enumerate() {
                insert_conv(&mut dict, &format!("{prefix}.{i}"), layer)?;
            }
        }
        if let Some(reduce) = &self.reduce {
            insert_conv(&mut dict, "reduce", reduce)?;
        }
        for stage in Stage::ALL {
            let layer = self.dense_layer(stage);
            let [gamma, beta, mean, var] = layer.norm().tensors();
            dict.insert_tensor(format!("{stage}.bn.weight"), &gamma)?;
            dict.insert_tensor(format!("{stage}.bn.bias"), &beta)?;
            dict.insert_tensor(format!("{stage}.bn.running_mean"), &mean)?;
            dict.insert_tensor(format!("{stage}.bn.running_var"), &var)?;
            dict.insert_tensor(format!("{stage}.fc.weight"), &layer.weights())?;
        }
        dict.insert_tensor("scale", &self.scale.val())?;
        Ok(dict)
    }

    /// Restores whatever `dict` provides; see [`LoadReport`] for the rest.
    #[must_use]
    pub fn load_state_dict(mut self, dict: &StateDict) -> (Self, LoadReport) {
        let mut report = LoadReport::default();
        self.base = restore_convs(self.base, "base", dict, &mut report);
        self.extras = restore_convs(self.extras, "extras", dict, &mut report);
        self.loc = restore_convs(self.loc, "loc", dict, &mut report);
        self.conf = restore_convs(self.conf, "conf", dict, &mut report);
        self.obj = restore_convs(self.obj, "obj", dict, &mut report);
        self.reduce = self
            .reduce
            .map(|reduce| restore_conv(reduce, "reduce", dict, &mut report));

        for stage in Stage::ALL {
            let layer = self.dense_layer_mut(stage);
            let names = ["weight", "bias", "running_mean", "running_var"];
            let mut index = 0;
            let tensors = layer.norm().tensors().map(|tensor| {
                let key = format!("{stage}.bn.{}", names[index]);
                index += 1;
                restore_tensor(&tensor, &key, dict, &mut report).unwrap_or(tensor)
            });
            layer.norm_mut().set_tensors(tensors);

            let key = format!("{stage}.fc.weight");
            if let Some(weights) = restore_tensor(&layer.weights(), &key, dict, &mut report) {
                // shape was checked by restore_tensor
                let _ = layer.set_weights(weights);
            }
        }
        self.scale = restore_param(self.scale, "scale", dict, &mut report);

        finish_report(dict, &mut report);
        (self, report)
    }

    /// Restores only the base layers.
    ///
    /// Accepts keys with or without a leading `base.`.
    #[must_use]
    pub fn load_base_state_dict(mut self, dict: &StateDict) -> (Self, LoadReport) {
        let trunk = if dict.keys().any(|key| key.starts_with("base.")) {
            dict.subtree("base.")
        } else {
            dict.clone()
        };
        let mut nested = StateDict::new();
        for key in trunk.keys() {
            if let Some(entry) = trunk.get(key) {
                nested.insert(format!("base.{key}"), entry.clone());
            }
        }

        let mut report = LoadReport::default();
        self.base = restore_convs(self.base, "base", &nested, &mut report);
        finish_report(&nested, &mut report);
        (self, report)
    }
}

fn insert_conv<B: Backend>(dict: &mut StateDict, prefix: &str, layer: &Conv2d<B>) -> Result<()> {
    dict.insert_tensor(format!("{prefix}.weight"), &layer.weight.val())?;
    if let Some(bias) = &layer.bias {
        dict.insert_tensor(format!("{prefix}.bias"), &bias.val())?;
    }
    Ok(())
}

fn restore_conv<B: Backend>(
    mut layer: Conv2d<B>,
    prefix: &str,
    dict: &StateDict,
    report: &mut LoadReport,
) -> Conv2d<B> {
    layer.weight = restore_param(layer.weight, &format!("{prefix}.weight"), dict, report);
    layer.bias = layer
        .bias
        .map(|bias| restore_param(bias, &format!("{prefix}.bias"), dict, report));
    layer
}

fn restore_convs<B: Backend>(
    layers: Vec<Conv2d<B>>,
    prefix: &str,
    dict: &StateDict,
    report: &mut LoadReport,
) -> Vec<Conv2d<B>> {
    layers
        .into_iter()
        .enumerate()
        .map(|(i, layer)| restore_conv(layer, &format!("{prefix}.{i}"), dict, report))
        .collect()
}

impl<B: Backend> DetectionNetwork<B> for ImprintedRfb<B> {
    fn forward(&self, images: Tensor<B, 4>) -> DetectionOutput<B> {
        let sources = self.sources(images);
        let loc = Self::head(&self.loc, &sources, 4);
        let features = Self::head(&self.conf, &sources, self.feature_dim);
        let obj = Self::head(&self.obj, &sources, 2);

        let [n, p, d] = features.dims();
        let f = features.reshape([n * p, d]);
        let s1 = self.denselayer1.forward(f.clone());
        let s2 = self
            .denselayer2
            .forward(Tensor::cat(vec![f.clone(), s1.clone()], 1));
        let s3 = self.denselayer3.forward(Tensor::cat(vec![f, s1, s2], 1));
        let conf = s3
            .mul(self.scale.val().unsqueeze::<2>())
            .reshape([n, p, self.n_way]);

        DetectionOutput { loc, conf, obj }
    }

    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let sources = self.sources(images);
        Self::head(&self.conf, &sources, self.feature_dim)
    }

    fn dense_layer(&self, stage: Stage) -> &DenseLayer<B> {
        match stage {
            Stage::First => &self.denselayer1,
            Stage::Second => &self.denselayer2,
            Stage::Third => &self.denselayer3,
        }
    }

    fn dense_layer_mut(&mut self, stage: Stage) -> &mut DenseLayer<B> {
        match stage {
            Stage::First => &mut self.denselayer1,
            Stage::Second => &mut self.denselayer2,
            Stage::Third => &mut self.denselayer3,
        }
    }

    fn n_way(&self) -> usize {
        self.n_way
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_priors(&self) -> usize {
        self.num_priors
    }
}

/// Learning-rate multiplier of the base layers.
pub const BASE_LR_FACTOR: f64 = 0.1;
/// Learning-rate multiplier of the source refinement layers.
pub const EXTRAS_LR_FACTOR: f64 = 0.5;

impl<B: AutodiffBackend> GradientGroups<B> for ImprintedRfb<B> {
    fn gradient_groups(&self, grads: &mut B::Gradients) -> Vec<GradientGroup> {
        let mut groups = vec![
            GradientGroup {
                name: "base",
                lr_factor: BASE_LR_FACTOR,
                grads: GradientsParams::from_module(grads, &self.base),
            },
            GradientGroup {
                name: "extras",
                lr_factor: EXTRAS_LR_FACTOR,
                grads: GradientsParams::from_module(grads, &self.extras),
            },
        ];
        if let Some(reduce) = &self.reduce {
            groups.push(GradientGroup {
                name: "reduce",
                lr_factor: EXTRAS_LR_FACTOR,
                grads: GradientsParams::from_module(grads, reduce),
            });
        }
        groups.push(GradientGroup {
            name: "heads",
            lr_factor: 1.0,
            grads: GradientsParams::from_module(grads, self),
        });
        groups
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    use crate::checkpoint::{CheckpointFormat, TensorEntry};
    use crate::prior::{DEFAULT_VARIANCE, PriorBox};

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    fn tiny_priors() -> PriorBoxConfig {
        PriorBoxConfig {
            image_size: 32,
            feature_maps: vec![4, 2, 1],
            steps: vec![8.0, 16.0, 32.0],
            min_sizes: vec![8.0, 16.0, 24.0],
            max_sizes: vec![16.0, 24.0, 32.0],
            aspect_ratios: vec![vec![2.0], vec![2.0], vec![2.0]],
            variance: DEFAULT_VARIANCE,
            clip: true,
        }
    }

    fn tiny_config() -> RfbConfig {
        RfbConfig::new(Architecture::RfbVgg, tiny_priors())
            .with_base_channels(vec![4, 8, 8])
            .with_source_channels(8)
            .with_feature_dim(6)
            .with_n_way(3)
    }

    fn images<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 4> {
        Tensor::ones([n, 3, 32, 32], device)
    }

    #[test]
    fn selectors_parse() {
        assert_eq!("RFB_vgg".parse::<Architecture>().unwrap(), Architecture::RfbVgg);
        assert_eq!("RFB_E_vgg".parse::<Architecture>().unwrap(), Architecture::RfbEVgg);
        assert!(matches!(
            "RFB_resnet".parse::<Architecture>(),
            Err(ModelError::UnknownArchitecture(_))
        ));
        assert_eq!("voc".parse::<DatasetKind>().unwrap(), DatasetKind::Voc);
        assert!("kitti".parse::<DatasetKind>().is_err());
        assert_eq!(Architecture::RfbMobile.to_string(), "RFB_mobile");
    }

    #[test]
    fn prior_preset_selection() {
        let vgg = Architecture::RfbVgg;
        assert_eq!(vgg.prior_preset(DatasetKind::Voc, 300).unwrap(), PriorPreset::Voc300);
        assert_eq!(vgg.prior_preset(DatasetKind::Coco, 512).unwrap(), PriorPreset::Coco512);
        assert!(vgg.prior_preset(DatasetKind::Voc, 416).is_err());
        assert_eq!(
            Architecture::RfbMobile
                .prior_preset(DatasetKind::Voc, 512)
                .unwrap(),
            PriorPreset::CocoMobile300
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = tiny_config().with_n_way(0);
        assert!(config.init::<TestBackend>(&Default::default()).is_err());
        let config = tiny_config().with_base_channels(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn forward_shapes_follow_priors() {
        let device = Default::default();
        let config = tiny_config();
        let network = config.init::<TestBackend>(&device).unwrap();
        let priors = PriorBox::new(config.priors.clone()).unwrap().generate();
        assert_eq!(network.num_priors(), priors.len());
        assert_eq!(network.num_priors(), 84);

        let out = network.forward(images(2, &device));
        assert_eq!(out.loc.dims(), [2, 84, 4]);
        assert_eq!(out.conf.dims(), [2, 84, 3]);
        assert_eq!(out.obj.dims(), [2, 84, 2]);

        let embedding = network.embed(images(2, &device));
        assert_eq!(embedding.dims(), [2, 84, 6]);
    }

    #[test]
    fn extended_variant_has_reduce_layer() {
        let device = Default::default();
        let mut config = tiny_config();
        config.architecture = Architecture::RfbEVgg;
        let network = config.init::<TestBackend>(&device).unwrap();
        let dict = network.state_dict().unwrap();
        assert!(dict.get("reduce.weight").is_some());
        assert_eq!(network.forward(images(1, &device)).conf.dims(), [1, 84, 3]);
    }

    #[test]
    fn conf_is_bounded_by_scale() {
        let device = Default::default();
        let network = tiny_config().init::<TestBackend>(&device).unwrap();
        let conf = network.forward(images(1, &device)).conf;
        let max = conf.abs().max().into_scalar();
        assert!(max <= 10.0 + 1e-4);
    }

    #[test]
    fn set_classifier_weights_and_normalize() {
        let device = Default::default();
        let mut network = tiny_config().init::<TestBackend>(&device).unwrap();
        assert!(
            network
                .set_classifier_weights(Stage::Second, Tensor::ones([3, 6], &device))
                .is_err()
        );
        network
            .set_classifier_weights(Stage::Second, Tensor::ones([3, 9], &device).mul_scalar(2.0))
            .unwrap();
        network.normalize();
        let norms = network
            .classifier_weights(Stage::Second)
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for norm in norms {
            assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn state_dict_round_trip_with_parallel_prefix() {
        let device = Default::default();
        let config = tiny_config();
        let source = config.init::<TestBackend>(&device).unwrap();
        let dict = source.state_dict().unwrap();
        assert!(dict.get("base.0.weight").is_some());
        assert!(dict.get("denselayer3.bn.running_var").is_some());
        assert_eq!(dict.get("denselayer3.fc.weight").unwrap().shape, vec![3, 12]);

        let mut prefixed = StateDict::new();
        for key in dict.keys() {
            prefixed.insert(format!("module.{key}"), dict.get(key).unwrap().clone());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = prefixed
            .save(&dir.path().join("weights"), CheckpointFormat::Binary)
            .unwrap();
        let loaded = StateDict::load(&path).unwrap();

        let target = config.init::<TestBackend>(&device).unwrap();
        let (target, report) = target.load_state_dict(&loaded);
        assert!(report.is_exact(), "{report:?}");
        assert_eq!(target.state_dict().unwrap(), dict);
    }

    #[test]
    fn lenient_load_reports_problems() {
        let device = Default::default();
        let network = tiny_config().init::<TestBackend>(&device).unwrap();
        let mut dict = StateDict::new();
        dict.insert(
            "scale",
            TensorEntry {
                shape: vec![1],
                values: vec![4.0],
            },
        );
        dict.insert(
            "denselayer1.fc.weight",
            TensorEntry {
                shape: vec![2, 2],
                values: vec![1.0; 4],
            },
        );
        dict.insert(
            "head.unknown",
            TensorEntry {
                shape: vec![1],
                values: vec![0.0],
            },
        );
        let (network, report) = network.load_state_dict(&dict);
        assert_eq!(network.scale().into_data().to_vec::<f32>().unwrap(), vec![4.0]);
        assert_eq!(report.loaded, vec!["scale"]);
        assert_eq!(report.mismatched, vec!["denselayer1.fc.weight"]);
        assert_eq!(report.unexpected, vec!["head.unknown"]);
        assert!(!report.missing.is_empty());
    }

    #[test]
    fn base_weights_load_without_prefix() {
        let device = Default::default();
        let config = tiny_config();
        let source = config.init::<TestBackend>(&device).unwrap();
        let base = source.state_dict().unwrap().subtree("base.");
        assert!(base.get("0.weight").is_some());

        let target = config.init::<TestBackend>(&device).unwrap();
        let (target, report) = target.load_base_state_dict(&base);
        assert!(report.is_exact(), "{report:?}");
        assert_eq!(
            target.state_dict().unwrap().get("base.2.weight"),
            source.state_dict().unwrap().get("base.2.weight")
        );
    }

    #[test]
    fn gradient_groups_partition_parameters() {
        let device = Default::default();
        let network = tiny_config().init::<TestAutodiff>(&device).unwrap();
        let out = network.forward(images(2, &device));
        let loss = out.loc.sum() + out.conf.sum() + out.obj.sum();
        let mut grads = loss.backward();
        let groups = network.gradient_groups(&mut grads);

        let names: Vec<_> = groups.iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["base", "extras", "heads"]);
        assert_eq!(groups[0].lr_factor, BASE_LR_FACTOR);
        assert_eq!(groups[1].lr_factor, EXTRAS_LR_FACTOR);
        // weight + bias per layer
        assert_eq!(groups[0].grads.len(), 6);
        assert_eq!(groups[1].grads.len(), 6);
        assert!(!groups[2].grads.is_empty());
    }
}
