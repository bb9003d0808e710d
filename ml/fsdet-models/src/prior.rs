//! Prior box generation.
//!
//! Priors tile every source feature map: each cell emits a square prior of
//! the map's minimum size, an optional square prior between the minimum and
//! maximum sizes, and a pair of rectangles per aspect ratio. The order is
//! fixed (map, row, column, anchor) and must agree with the order in which
//! the network flattens its head outputs.

use std::fmt;
use std::str::FromStr;

use fsdet_types::Prior;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Encoding variances used by the box coder.
pub const DEFAULT_VARIANCE: [f32; 2] = [0.1, 0.2];

/// Prior layout parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorBoxConfig {
    /// Input image side in pixels.
    pub image_size: u32,
    /// Side length of every source feature map.
    pub feature_maps: Vec<usize>,
    /// Pixel stride of every source map.
    pub steps: Vec<f32>,
    /// Minimum prior size in pixels, per map.
    pub min_sizes: Vec<f32>,
    /// Maximum prior size in pixels, per map (may be empty).
    pub max_sizes: Vec<f32>,
    /// Extra aspect ratios per map; each adds two priors per cell.
    pub aspect_ratios: Vec<Vec<f32>>,
    /// Box coder variances.
    pub variance: [f32; 2],
    /// Clamp every coordinate to `[0, 1]`.
    pub clip: bool,
}

impl PriorBoxConfig {
    /// VOC layout for 300×300 inputs.
    #[must_use]
    pub fn voc_300() -> Self {
        Self {
            image_size: 300,
            feature_maps: vec![38, 19, 10, 5, 3, 1],
            steps: vec![8.0, 16.0, 32.0, 64.0, 100.0, 300.0],
            min_sizes: vec![30.0, 60.0, 111.0, 162.0, 213.0, 264.0],
            max_sizes: vec![60.0, 111.0, 162.0, 213.0, 264.0, 315.0],
            aspect_ratios: ratios(4, 2),
            variance: DEFAULT_VARIANCE,
            clip: true,
        }
    }

    /// VOC layout for 512×512 inputs.
    #[must_use]
    pub fn voc_512() -> Self {
        Self {
            image_size: 512,
            feature_maps: vec![64, 32, 16, 8, 4, 2, 1],
            steps: vec![8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0],
            min_sizes: vec![32.0, 76.8, 153.6, 230.4, 307.2, 384.0, 460.8],
            max_sizes: vec![76.8, 153.6, 230.4, 307.2, 384.0, 460.8, 537.6],
            aspect_ratios: ratios(5, 2),
            variance: DEFAULT_VARIANCE,
            clip: true,
        }
    }

    /// COCO layout for 300×300 inputs.
    #[must_use]
    pub fn coco_300() -> Self {
        Self {
            min_sizes: vec![21.0, 45.0, 99.0, 153.0, 207.0, 261.0],
            max_sizes: vec![45.0, 99.0, 153.0, 207.0, 261.0, 315.0],
            ..Self::voc_300()
        }
    }

    /// COCO layout for 512×512 inputs.
    #[must_use]
    pub fn coco_512() -> Self {
        Self {
            min_sizes: vec![20.48, 51.2, 133.12, 215.04, 296.96, 378.88, 460.8],
            max_sizes: vec![51.2, 133.12, 215.04, 296.96, 378.88, 460.8, 542.72],
            aspect_ratios: ratios(4, 3),
            ..Self::voc_512()
        }
    }

    /// COCO layout for the mobile backbone at 300×300.
    #[must_use]
    pub fn coco_mobile_300() -> Self {
        Self {
            image_size: 300,
            feature_maps: vec![19, 10, 5, 3, 2, 1],
            steps: vec![16.0, 32.0, 64.0, 100.0, 150.0, 300.0],
            min_sizes: vec![45.0, 90.0, 135.0, 180.0, 225.0, 270.0],
            max_sizes: vec![90.0, 135.0, 180.0, 225.0, 270.0, 315.0],
            aspect_ratios: ratios(4, 2),
            variance: DEFAULT_VARIANCE,
            clip: true,
        }
    }

    /// Returns a config for a preset.
    #[must_use]
    pub fn preset(preset: PriorPreset) -> Self {
        match preset {
            PriorPreset::Voc300 => Self::voc_300(),
            PriorPreset::Voc512 => Self::voc_512(),
            PriorPreset::Coco300 => Self::coco_300(),
            PriorPreset::Coco512 => Self::coco_512(),
            PriorPreset::CocoMobile300 => Self::coco_mobile_300(),
        }
    }

    /// Sets the clip flag.
    #[must_use]
    pub const fn with_clip(mut self, clip: bool) -> Self {
        self.clip = clip;
        self
    }

    /// Number of source feature maps.
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.feature_maps.len()
    }

    /// Priors emitted per cell of source `k`.
    #[must_use]
    pub fn anchors_per_cell(&self, k: usize) -> usize {
        let ratios = self.aspect_ratios.get(k).map_or(0, Vec::len);
        1 + usize::from(!self.max_sizes.is_empty()) + 2 * ratios
    }

    /// Total number of priors.
    #[must_use]
    pub fn num_priors(&self) -> usize {
        self.feature_maps
            .iter()
            .enumerate()
            .map(|(k, &f)| f * f * self.anchors_per_cell(k))
            .sum()
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let n = self.feature_maps.len();
        if n == 0 {
            return Err(ModelError::invalid_config("no feature maps"));
        }
        if self.image_size == 0 {
            return Err(ModelError::invalid_config("image_size must be positive"));
        }
        if self.steps.len() != n || self.min_sizes.len() != n || self.aspect_ratios.len() != n {
            return Err(ModelError::invalid_config(format!(
                "per-source lists must have {n} entries (steps {}, min_sizes {}, aspect_ratios {})",
                self.steps.len(),
                self.min_sizes.len(),
                self.aspect_ratios.len()
            )));
        }
        if !self.max_sizes.is_empty() && self.max_sizes.len() != n {
            return Err(ModelError::invalid_config(format!(
                "max_sizes must be empty or have {n} entries"
            )));
        }
        if self.feature_maps.contains(&0) {
            return Err(ModelError::invalid_config("feature map size must be positive"));
        }
        let positive = |v: &f32| v.is_finite() && *v > 0.0;
        if !self.steps.iter().all(positive) {
            return Err(ModelError::invalid_config("steps must be positive"));
        }
        if !self.min_sizes.iter().all(positive) || !self.max_sizes.iter().all(positive) {
            return Err(ModelError::invalid_config("prior sizes must be positive"));
        }
        if !self.aspect_ratios.iter().flatten().all(positive) {
            return Err(ModelError::invalid_config("aspect ratios must be positive"));
        }
        if !self.variance.iter().all(positive) {
            return Err(ModelError::invalid_config("variances must be positive"));
        }
        Ok(())
    }
}

fn ratios(wide: usize, square: usize) -> Vec<Vec<f32>> {
    (0..wide)
        .map(|_| vec![2.0, 3.0])
        .chain((0..square).map(|_| vec![2.0]))
        .collect()
}

/// Named prior layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorPreset {
    /// `VOC_300`.
    Voc300,
    /// `VOC_512`.
    Voc512,
    /// `COCO_300`.
    Coco300,
    /// `COCO_512`.
    Coco512,
    /// `COCO_mobile_300`.
    CocoMobile300,
}

impl PriorPreset {
    /// Returns the preset name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Voc300 => "VOC_300",
            Self::Voc512 => "VOC_512",
            Self::Coco300 => "COCO_300",
            Self::Coco512 => "COCO_512",
            Self::CocoMobile300 => "COCO_mobile_300",
        }
    }
}

impl fmt::Display for PriorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PriorPreset {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VOC_300" => Ok(Self::Voc300),
            "VOC_512" => Ok(Self::Voc512),
            "COCO_300" => Ok(Self::Coco300),
            "COCO_512" => Ok(Self::Coco512),
            "COCO_MOBILE_300" => Ok(Self::CocoMobile300),
            other => Err(ModelError::invalid_config(format!(
                "unknown prior preset: {other}"
            ))),
        }
    }
}

/// Validated prior generator.
///
/// # Example
///
/// ```
/// use fsdet_models::{PriorBox, PriorBoxConfig};
///
/// let priors = PriorBox::new(PriorBoxConfig::voc_300()).unwrap().generate();
/// assert_eq!(priors.len(), 11_620);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBox {
    config: PriorBoxConfig,
}

impl PriorBox {
    /// Validates `config` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for an inconsistent layout.
    pub fn new(config: PriorBoxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PriorBoxConfig {
        &self.config
    }

    /// Emits the full, ordered prior set.
    ///
    /// Arithmetic runs in `f64` and is rounded once per coordinate, so the
    /// output is bit-identical for identical configs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn generate(&self) -> Vec<Prior> {
        let c = &self.config;
        let image = f64::from(c.image_size);
        let mut priors = Vec::with_capacity(c.num_priors());

        for (k, &f) in c.feature_maps.iter().enumerate() {
            let f_k = image / f64::from(c.steps[k]);
            let s_k = f64::from(c.min_sizes[k]) / image;
            let s_k_prime = c
                .max_sizes
                .get(k)
                .map(|&max| (s_k * (f64::from(max) / image)).sqrt());

            for i in 0..f {
                for j in 0..f {
                    let cx = (j as f64 + 0.5) / f_k;
                    let cy = (i as f64 + 0.5) / f_k;
                    let mut push = |w: f64, h: f64| {
                        let prior = Prior::new(cx as f32, cy as f32, w as f32, h as f32);
                        priors.push(if c.clip { prior.clamped() } else { prior });
                    };

                    push(s_k, s_k);
                    if let Some(s) = s_k_prime {
                        push(s, s);
                    }
                    for &ar in &c.aspect_ratios[k] {
                        let r = f64::from(ar).sqrt();
                        push(s_k * r, s_k / r);
                        push(s_k / r, s_k * r);
                    }
                }
            }
        }
        priors
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn preset_prior_counts() {
        assert_eq!(PriorBoxConfig::voc_300().num_priors(), 11_620);
        assert_eq!(PriorBoxConfig::voc_512().num_priors(), 32_756);
        assert_eq!(PriorBoxConfig::coco_300().num_priors(), 11_620);
        assert_eq!(PriorBoxConfig::coco_512().num_priors(), 32_756 - 4 * 4 * 2);
        for preset in [
            PriorPreset::Voc300,
            PriorPreset::Voc512,
            PriorPreset::Coco300,
            PriorPreset::Coco512,
            PriorPreset::CocoMobile300,
        ] {
            let config = PriorBoxConfig::preset(preset);
            let priors = PriorBox::new(config.clone()).unwrap().generate();
            assert_eq!(priors.len(), config.num_priors(), "{preset}");
        }
    }

    #[test]
    fn anchors_per_cell_follow_ratios() {
        let config = PriorBoxConfig::voc_300();
        assert_eq!(config.anchors_per_cell(0), 6);
        assert_eq!(config.anchors_per_cell(4), 4);
        let no_max = PriorBoxConfig {
            max_sizes: Vec::new(),
            ..config
        };
        assert_eq!(no_max.anchors_per_cell(0), 5);
    }

    #[test]
    fn first_cell_priors() {
        let priors = PriorBox::new(PriorBoxConfig::voc_300()).unwrap().generate();
        let center = 0.5 / 37.5;
        let first = priors[0];
        assert_relative_eq!(first.cx, center, epsilon = 1e-6);
        assert_relative_eq!(first.cy, center, epsilon = 1e-6);
        assert_relative_eq!(first.w, 0.1, epsilon = 1e-6);

        assert_relative_eq!(priors[1].w, (0.1f32 * 0.2).sqrt(), epsilon = 1e-6);

        let r = 2.0f32.sqrt();
        assert_relative_eq!(priors[2].w, 0.1 * r, epsilon = 1e-6);
        assert_relative_eq!(priors[2].h, 0.1 / r, epsilon = 1e-6);
        assert_relative_eq!(priors[3].w, 0.1 / r, epsilon = 1e-6);
        assert_relative_eq!(priors[3].h, 0.1 * r, epsilon = 1e-6);

        // second cell moves along x first
        assert_relative_eq!(priors[6].cx, 1.5 / 37.5, epsilon = 1e-6);
        assert_relative_eq!(priors[6].cy, center, epsilon = 1e-6);
    }

    #[test]
    fn generation_is_deterministic() {
        let generator = PriorBox::new(PriorBoxConfig::coco_512()).unwrap();
        let a = generator.generate();
        let b = generator.generate();
        assert!(
            a.iter()
                .zip(&b)
                .all(|(x, y)| x.as_array().map(f32::to_bits) == y.as_array().map(f32::to_bits))
        );
    }

    #[test]
    fn clip_bounds_coordinates() {
        let priors = PriorBox::new(PriorBoxConfig::voc_300()).unwrap().generate();
        assert!(
            priors
                .iter()
                .flat_map(Prior::as_array)
                .all(|v| (0.0..=1.0).contains(&v))
        );

        let unclipped = PriorBox::new(PriorBoxConfig::voc_300().with_clip(false))
            .unwrap()
            .generate();
        assert!(unclipped.iter().any(|p| p.w > 1.0));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut empty = PriorBoxConfig::voc_300();
        empty.feature_maps.clear();
        assert!(PriorBox::new(empty).is_err());

        let mut short = PriorBoxConfig::voc_300();
        short.steps.pop();
        assert!(PriorBox::new(short).is_err());

        let mut zero_step = PriorBoxConfig::voc_300();
        zero_step.steps[0] = 0.0;
        assert!(PriorBox::new(zero_step).is_err());

        let mut bad_ratio = PriorBoxConfig::voc_300();
        bad_ratio.aspect_ratios[0] = vec![-1.0];
        assert!(PriorBox::new(bad_ratio).is_err());

        let zero_image = PriorBoxConfig {
            image_size: 0,
            ..PriorBoxConfig::voc_300()
        };
        assert!(matches!(
            PriorBox::new(zero_image),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn preset_parsing() {
        assert_eq!("voc_300".parse::<PriorPreset>().unwrap(), PriorPreset::Voc300);
        assert_eq!(
            "COCO_mobile_300".parse::<PriorPreset>().unwrap(),
            PriorPreset::CocoMobile300
        );
        assert!("VOC_600".parse::<PriorPreset>().is_err());
    }
}
