//! CLIP image normalisation and a self-contained projection embedder
//!
//! [`ProjectionEmbedder`] stands in for pretrained CLIP weights: the image
//! tower average-pools to a small grid and applies a fixed random projection;
//! the text tower maps colour words onto the embedding of a uniform swatch of
//! that colour, so text and image share one space.

use std::sync::OnceLock;

use burn::prelude::*;
use burn::tensor::module::adaptive_avg_pool2d;
use burn_cgd_core::{l2_normalize, Embedder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use regex::Regex;

use crate::variant::ClipVariant;

/// Per-channel mean of the CLIP training images
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
/// Per-channel std of the CLIP training images
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Normalise `[n, 3, h, w]` images in [0, 1] with the CLIP statistics
pub fn normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(CLIP_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(CLIP_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}

const DEFAULT_GRID: usize = 4;

/// Colour vocabulary understood by the text tower, RGB in [0, 1]
const COLOURS: &[(&str, [f32; 3])] = &[
    ("red", [0.9, 0.1, 0.1]),
    ("green", [0.1, 0.75, 0.2]),
    ("blue", [0.1, 0.2, 0.9]),
    ("yellow", [0.95, 0.9, 0.1]),
    ("orange", [1.0, 0.55, 0.05]),
    ("purple", [0.5, 0.15, 0.7]),
    ("pink", [1.0, 0.6, 0.75]),
    ("cyan", [0.1, 0.85, 0.9]),
    ("magenta", [0.9, 0.1, 0.8]),
    ("brown", [0.45, 0.3, 0.15]),
    ("white", [0.97, 0.97, 0.97]),
    ("black", [0.03, 0.03, 0.03]),
    ("gray", [0.5, 0.5, 0.5]),
    ("grey", [0.5, 0.5, 0.5]),
];

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}]+|[\p{N}]+").expect("word pattern should compile"))
}

/// Lowercased words of a prompt
pub fn words(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    word_pattern()
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// RGB swatch colour for a word, if it names one
pub fn colour_of(word: &str) -> Option<[f32; 3]> {
    COLOURS
        .iter()
        .find(|(name, _)| *name == word)
        .map(|(_, rgb)| *rgb)
}

fn fnv1a(word: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Random-projection CLIP stand-in
#[derive(Debug, Clone)]
pub struct ProjectionEmbedder {
    variant: ClipVariant,
    input_resolution: usize,
    grid: usize,
    /// Row-major `[3 * grid * grid, embed_dim]`
    projection: Vec<f32>,
    seed: u64,
}

impl ProjectionEmbedder {
    pub fn new(variant: ClipVariant, seed: u64) -> Self {
        let grid = DEFAULT_GRID;
        let fan_in = 3 * grid * grid;
        let scale = 1.0 / (fan_in as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let projection = (0..fan_in * variant.embed_dim())
            .map(|_| {
                let v: f32 = StandardNormal.sample(&mut rng);
                v * scale
            })
            .collect();

        Self {
            variant,
            input_resolution: variant.input_resolution(),
            grid,
            projection,
            seed,
        }
    }

    /// Override the input resolution (smaller crops for quick runs)
    pub fn with_input_resolution(mut self, resolution: usize) -> Self {
        self.input_resolution = resolution.max(self.grid);
        self
    }

    pub fn variant(&self) -> ClipVariant {
        self.variant
    }

    fn projection_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let fan_in = 3 * self.grid * self.grid;
        Tensor::from_data(
            TensorData::new(self.projection.clone(), [fan_in, self.variant.embed_dim()]),
            device,
        )
    }

    /// Unnormalised embedding of a uniform swatch
    fn swatch_features<B: Backend>(&self, rgb: [f32; 3], device: &B::Device) -> Tensor<B, 2> {
        let cells = self.grid * self.grid;
        let data: Vec<f32> = rgb
            .iter()
            .flat_map(|&c| std::iter::repeat(c).take(cells))
            .collect();
        let swatch = Tensor::from_data(TensorData::new(data, [1, 3, self.grid, self.grid]), device);
        self.project(normalize(swatch))
    }

    /// Deterministic direction for a word outside the colour vocabulary
    fn word_features<B: Backend>(&self, word: &str, device: &B::Device) -> Tensor<B, 2> {
        let dim = self.variant.embed_dim();
        let mut rng = StdRng::seed_from_u64(fnv1a(word) ^ self.seed);
        let values: Vec<f32> = (0..dim)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        l2_normalize(Tensor::from_data(TensorData::new(values, [1, dim]), device), 1)
    }

    fn project<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, _, _, _] = images.dims();
        let device = images.device();
        let pooled = adaptive_avg_pool2d(images, [self.grid, self.grid]);
        let flat = pooled.reshape([n, 3 * self.grid * self.grid]);
        flat.matmul(self.projection_tensor(&device))
    }
}

impl<B: Backend> Embedder<B> for ProjectionEmbedder {
    fn input_resolution(&self) -> usize {
        self.input_resolution
    }

    fn embed_dim(&self) -> usize {
        self.variant.embed_dim()
    }

    fn embed_text(&self, texts: &[&str], device: &B::Device) -> Tensor<B, 2> {
        let rows: Vec<Tensor<B, 2>> = texts
            .iter()
            .map(|text| {
                let words = words(text);
                if words.is_empty() {
                    return self.word_features(text, device);
                }
                words
                    .iter()
                    .map(|word| match colour_of(word) {
                        Some(rgb) => l2_normalize(self.swatch_features(rgb, device), 1),
                        None => self.word_features(word, device),
                    })
                    .reduce(|acc, row| acc + row)
                    .unwrap_or_else(|| Tensor::zeros([1, self.variant.embed_dim()], device))
            })
            .collect();

        if rows.is_empty() {
            return Tensor::zeros([0, self.variant.embed_dim()], device);
        }
        l2_normalize(Tensor::cat(rows, 0), 1)
    }

    fn embed_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        l2_normalize(self.project(images), 1)
    }
}
