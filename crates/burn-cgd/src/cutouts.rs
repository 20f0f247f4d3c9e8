//! Random multi-crop augmentation for CLIP scoring
//!
//! Every operation is slicing, pooling, flipping or arithmetic, so crops stay
//! differentiable with respect to the input batch.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::module::adaptive_avg_pool2d;
use burn_cgd_core::{CgdError, Result};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::noise::gaussian_noise;

/// A per-crop augmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Augmentation {
    HorizontalFlip,
    VerticalFlip,
    /// Shift by up to `max_fraction` of the side, filling with zeros
    Translate { max_fraction: f64 },
    /// Random scale factors drawn from `1 ± amount`
    ColorJitter {
        brightness: f64,
        contrast: f64,
        saturation: f64,
    },
    Grayscale,
    GaussianNoise { std: f64 },
}

impl Augmentation {
    /// Magnitudes must be finite and non-negative
    pub fn validate(&self) -> Result<()> {
        let params: &[(&str, f64)] = match self {
            Augmentation::Translate { max_fraction } => &[("max_fraction", *max_fraction)],
            Augmentation::ColorJitter {
                brightness,
                contrast,
                saturation,
            } => &[
                ("brightness", *brightness),
                ("contrast", *contrast),
                ("saturation", *saturation),
            ],
            Augmentation::GaussianNoise { std } => &[("std", *std)],
            _ => &[],
        };
        match params.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            Some((name, v)) => Err(CgdError::config(format!(
                "augmentation {name} must be a non-negative number, got {v}"
            ))),
            None => Ok(()),
        }
    }

    pub fn with_probability(self, probability: f64) -> AugmentationStep {
        AugmentationStep {
            augmentation: self,
            probability,
        }
    }
}

/// An augmentation and the chance it fires on a given crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationStep {
    pub augmentation: Augmentation,
    pub probability: f64,
}

impl FromStr for AugmentationStep {
    type Err = CgdError;

    /// Parse `name[:probability]`, e.g. `hflip`, `noise:0.25`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, probability) = match s.split_once(':') {
            Some((name, p)) => {
                let p = p
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| CgdError::config(format!("invalid augmentation probability in '{s}'")))?;
                (name.trim(), p)
            }
            None => (s.trim(), 0.5),
        };

        let augmentation = match name.to_ascii_lowercase().as_str() {
            "hflip" | "horizontal_flip" => Augmentation::HorizontalFlip,
            "vflip" | "vertical_flip" => Augmentation::VerticalFlip,
            "translate" => Augmentation::Translate { max_fraction: 0.1 },
            "jitter" | "color_jitter" => Augmentation::ColorJitter {
                brightness: 0.1,
                contrast: 0.1,
                saturation: 0.1,
            },
            "gray" | "grayscale" => Augmentation::Grayscale,
            "noise" | "gaussian_noise" => Augmentation::GaussianNoise { std: 0.1 },
            other => {
                return Err(CgdError::config(format!(
                    "unknown augmentation '{other}', expected one of: hflip, vflip, translate, jitter, gray, noise"
                )))
            }
        };

        Ok(augmentation.with_probability(probability))
    }
}

impl fmt::Display for AugmentationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.augmentation {
            Augmentation::HorizontalFlip => "hflip",
            Augmentation::VerticalFlip => "vflip",
            Augmentation::Translate { .. } => "translate",
            Augmentation::ColorJitter { .. } => "jitter",
            Augmentation::Grayscale => "gray",
            Augmentation::GaussianNoise { .. } => "noise",
        };
        write!(f, "{name}:{}", self.probability)
    }
}

/// Cutout ensemble settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoutConfig {
    /// Output side length (the embedder's input resolution)
    pub cut_size: usize,
    pub num_cutouts: usize,
    /// 0 gives uniform crop sizes; larger values favour full-image crops
    pub cutout_power: f64,
    pub augmentations: Vec<AugmentationStep>,
}

impl CutoutConfig {
    pub fn new(cut_size: usize, num_cutouts: usize) -> Self {
        Self {
            cut_size,
            num_cutouts,
            cutout_power: 1.0,
            augmentations: Vec::new(),
        }
    }

    pub fn with_power(mut self, cutout_power: f64) -> Self {
        self.cutout_power = cutout_power;
        self
    }

    pub fn with_augmentations(mut self, augmentations: Vec<AugmentationStep>) -> Self {
        self.augmentations = augmentations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_cutouts == 0 {
            return Err(CgdError::config("number of cutouts must be greater than zero"));
        }
        if self.cut_size == 0 {
            return Err(CgdError::config("cutout size must be greater than zero"));
        }
        if !self.cutout_power.is_finite() || self.cutout_power < 0.0 {
            return Err(CgdError::config(format!(
                "cutout power must be a non-negative number, got {}",
                self.cutout_power
            )));
        }
        for step in &self.augmentations {
            if !(0.0..=1.0).contains(&step.probability) {
                return Err(CgdError::config(format!(
                    "augmentation probability must be in [0, 1], got {step}"
                )));
            }
            step.augmentation.validate()?;
        }
        Ok(())
    }
}

/// Cutout sampler
#[derive(Debug, Clone)]
pub struct MakeCutouts {
    config: CutoutConfig,
}

impl MakeCutouts {
    pub fn new(config: CutoutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CutoutConfig {
        &self.config
    }

    pub fn num_cutouts(&self) -> usize {
        self.config.num_cutouts
    }

    pub fn cut_size(&self) -> usize {
        self.config.cut_size
    }

    /// Side length for a uniform draw `u` in [0, 1)
    fn crop_size(&self, u: f64, min_size: usize, max_size: usize) -> usize {
        let exponent = 1.0 / (1.0 + self.config.cutout_power);
        let size = min_size as f64 + (max_size - min_size) as f64 * u.powf(exponent);
        (size as usize).clamp(min_size.max(1), max_size)
    }

    /// Crop `[n, c, h, w]` images into `[num_cutouts * n, c, cut, cut]`
    ///
    /// Output index `k * n + b` holds cutout `k` of image `b`.
    pub fn forward<B: Backend>(&self, images: Tensor<B, 4>, rng: &mut StdRng) -> Tensor<B, 4> {
        let [n, c, h, w] = images.dims();
        let cut = self.config.cut_size;
        let max_size = h.min(w);
        let min_size = max_size.min(cut);

        let mut crops = Vec::with_capacity(self.config.num_cutouts * n);
        for _ in 0..self.config.num_cutouts {
            for b in 0..n {
                let size = self.crop_size(rng.gen::<f64>(), min_size, max_size);
                let offset_x = rng.gen_range(0..=w - size);
                let offset_y = rng.gen_range(0..=h - size);

                let crop = images.clone().slice([
                    b..b + 1,
                    0..c,
                    offset_y..offset_y + size,
                    offset_x..offset_x + size,
                ]);
                let crop = adaptive_avg_pool2d(crop, [cut, cut]);
                crops.push(self.augment(crop, rng));
            }
        }

        Tensor::cat(crops, 0)
    }

    fn augment<B: Backend>(&self, mut crop: Tensor<B, 4>, rng: &mut StdRng) -> Tensor<B, 4> {
        for step in &self.config.augmentations {
            if rng.gen::<f64>() >= step.probability {
                continue;
            }
            crop = match step.augmentation {
                Augmentation::HorizontalFlip => crop.flip([3]),
                Augmentation::VerticalFlip => crop.flip([2]),
                Augmentation::Translate { max_fraction } => {
                    let [_, _, h, w] = crop.dims();
                    let max_dx = (w as f64 * max_fraction) as isize;
                    let max_dy = (h as f64 * max_fraction) as isize;
                    let dx = rng.gen_range(-max_dx..=max_dx);
                    let dy = rng.gen_range(-max_dy..=max_dy);
                    translate(crop, dx, dy)
                }
                Augmentation::ColorJitter {
                    brightness,
                    contrast,
                    saturation,
                } => {
                    let b = 1.0 + rng.gen_range(-brightness..=brightness);
                    let k = 1.0 + rng.gen_range(-contrast..=contrast);
                    let s = 1.0 + rng.gen_range(-saturation..=saturation);
                    color_jitter(crop, b, k, s)
                }
                Augmentation::Grayscale => grayscale(crop),
                Augmentation::GaussianNoise { std } => {
                    let noise = gaussian_noise::<B, 4>(rng, crop.dims(), &crop.device());
                    crop + noise * std
                }
            };
        }
        crop
    }
}

/// Shift by `(dx, dy)` pixels, filling uncovered pixels with zeros
fn translate<B: Backend>(x: Tensor<B, 4>, dx: isize, dy: isize) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    if dx.unsigned_abs() >= w || dy.unsigned_abs() >= h {
        return x.zeros_like();
    }
    if dx == 0 && dy == 0 {
        return x;
    }

    let span = |d: isize, len: usize| {
        let d_abs = d.unsigned_abs();
        if d >= 0 {
            (0..len - d_abs, d_abs..len)
        } else {
            (d_abs..len, 0..len - d_abs)
        }
    };
    let (src_x, dst_x) = span(dx, w);
    let (src_y, dst_y) = span(dy, h);

    let region = x.clone().slice([0..n, 0..c, src_y, src_x]);
    x.zeros_like().slice_assign([0..n, 0..c, dst_y, dst_x], region)
}

fn color_jitter<B: Backend>(x: Tensor<B, 4>, brightness: f64, contrast: f64, saturation: f64) -> Tensor<B, 4> {
    let x = x * brightness;
    let mean = x.clone().mean().reshape([1, 1, 1, 1]);
    let x = (x - mean.clone()) * contrast + mean;
    let gray = x.clone().mean_dim(1);
    (x - gray.clone()) * saturation + gray
}

fn grayscale<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, c, _, _] = x.dims();
    let gray = x.mean_dim(1);
    Tensor::cat(vec![gray; c], 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn two_flat_images(h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::ones([1, 3, h, w], &device) * 0.2;
        let b = Tensor::<TestBackend, 4>::ones([1, 3, h, w], &device) * -0.7;
        Tensor::cat(vec![a, b], 0)
    }

    #[test]
    fn test_crop_count_and_size_for_powers() {
        let mut rng = StdRng::seed_from_u64(0);
        for power in [0.0, 1.0, 25.0] {
            let cutouts = MakeCutouts::new(CutoutConfig::new(16, 4).with_power(power)).unwrap();
            let crops = cutouts.forward(two_flat_images(32, 32), &mut rng);
            assert_eq!(crops.dims(), [8, 3, 16, 16]);
        }
    }

    #[test]
    fn test_upsamples_small_images() {
        let mut rng = StdRng::seed_from_u64(0);
        let cutouts = MakeCutouts::new(CutoutConfig::new(16, 3)).unwrap();
        let crops = cutouts.forward(two_flat_images(8, 8), &mut rng);
        assert_eq!(crops.dims(), [6, 3, 16, 16]);
    }

    #[test]
    fn test_cutout_major_order() {
        let mut rng = StdRng::seed_from_u64(3);
        let cutouts = MakeCutouts::new(CutoutConfig::new(4, 3)).unwrap();
        let crops = cutouts.forward(two_flat_images(8, 8), &mut rng);
        for i in 0..6 {
            let v: Vec<f32> = crops
                .clone()
                .slice([i..i + 1, 0..1, 0..1, 0..1])
                .into_data()
                .to_vec()
                .unwrap();
            let expected = if i % 2 == 0 { 0.2 } else { -0.7 };
            assert!((v[0] - expected).abs() < 1e-6, "crop {i}");
        }
    }

    #[test]
    fn test_large_power_prefers_full_crops() {
        let cutouts = MakeCutouts::new(CutoutConfig::new(16, 1).with_power(50.0)).unwrap();
        assert!(cutouts.crop_size(0.1, 16, 64) >= 60);
        let uniform = MakeCutouts::new(CutoutConfig::new(16, 1).with_power(0.0)).unwrap();
        assert_eq!(uniform.crop_size(0.5, 16, 64), 40);
    }

    #[test]
    fn test_same_seed_same_crops() {
        let config = CutoutConfig::new(8, 4).with_augmentations(vec![
            Augmentation::HorizontalFlip.with_probability(0.5),
            Augmentation::GaussianNoise { std: 0.1 }.with_probability(0.5),
        ]);
        let cutouts = MakeCutouts::new(config).unwrap();
        let device = Default::default();
        let image: Tensor<TestBackend, 4> =
            Tensor::from_data(TensorData::new((0..3 * 16 * 16).map(|i| i as f32 / 768.0).collect::<Vec<_>>(), [1, 3, 16, 16]), &device);
        let a: Vec<f32> = cutouts
            .forward(image.clone(), &mut StdRng::seed_from_u64(11))
            .into_data()
            .to_vec()
            .unwrap();
        let b: Vec<f32> = cutouts
            .forward(image, &mut StdRng::seed_from_u64(11))
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_crops_are_differentiable() {
        let device = Default::default();
        let config = CutoutConfig::new(8, 2).with_augmentations(vec![
            Augmentation::HorizontalFlip.with_probability(1.0),
            Augmentation::Translate { max_fraction: 0.25 }.with_probability(1.0),
            Augmentation::ColorJitter {
                brightness: 0.1,
                contrast: 0.1,
                saturation: 0.1,
            }
            .with_probability(1.0),
        ]);
        let cutouts = MakeCutouts::new(config).unwrap();
        let x = Tensor::<TestAutodiffBackend, 4>::ones([1, 3, 16, 16], &device).require_grad();
        let crops = cutouts.forward(x.clone(), &mut StdRng::seed_from_u64(0));
        let grads = crops.sum().backward();
        let grad: Vec<f32> = x.grad(&grads).unwrap().into_data().to_vec().unwrap();
        assert!(grad.iter().any(|g| *g != 0.0));
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_translate_fills_with_zeros() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 3, 3], &device);
        let shifted: Vec<f32> = translate(x, 1, 0).into_data().to_vec().unwrap();
        assert_eq!(shifted, vec![0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_grayscale_equalises_channels() {
        let device = Default::default();
        let x: Tensor<TestBackend, 4> =
            Tensor::from_data(TensorData::new(vec![0.0f32, 0.3, 0.9], [1, 3, 1, 1]), &device);
        let g: Vec<f32> = grayscale(x).into_data().to_vec().unwrap();
        assert!(g.iter().all(|v| (v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_parse_augmentations() {
        let step: AugmentationStep = "noise:0.25".parse().unwrap();
        assert_eq!(step.augmentation, Augmentation::GaussianNoise { std: 0.1 });
        assert_eq!(step.probability, 0.25);
        assert_eq!("hflip".parse::<AugmentationStep>().unwrap().probability, 0.5);
        assert!("blur".parse::<AugmentationStep>().is_err());
        assert!(CutoutConfig::new(16, 0).validate().is_err());
        assert!(CutoutConfig::new(16, 1)
            .with_augmentations(vec![Augmentation::Grayscale.with_probability(1.5)])
            .validate()
            .is_err());
    }

    #[test]
    fn test_negative_magnitudes_rejected() {
        let bad = [
            Augmentation::Translate { max_fraction: -0.1 },
            Augmentation::ColorJitter {
                brightness: 0.1,
                contrast: -0.2,
                saturation: 0.1,
            },
            Augmentation::GaussianNoise { std: f64::NAN },
        ];
        for augmentation in bad {
            let config = CutoutConfig::new(16, 2).with_augmentations(vec![augmentation.with_probability(1.0)]);
            assert!(matches!(config.validate(), Err(CgdError::Config(_))));
            assert!(MakeCutouts::new(config).is_err());
        }

        // A config read back from JSON goes through the same check
        let json = r#"{"cut_size":16,"num_cutouts":2,"cutout_power":1.0,"augmentations":[
            {"augmentation":{"kind":"color_jitter","brightness":-0.5,"contrast":0.0,"saturation":0.0},"probability":1.0}]}"#;
        let config: CutoutConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());

        let zero = Augmentation::Translate { max_fraction: 0.0 }.with_probability(1.0);
        assert!(CutoutConfig::new(16, 2).with_augmentations(vec![zero]).validate().is_ok());
    }
}
