//! Noise-prediction network interface
//!
//! A [`Denoiser`] is the neural half of a diffusion model: given a noisy
//! batch and a timestep it predicts the noise that was added. The schedule
//! arithmetic that turns the prediction into posterior means and variances
//! lives in `burn-cgd-samplers`.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Raw network output for one forward pass
pub struct DenoiserOutput<B: Backend> {
    /// Predicted noise ε, same shape as the input
    pub eps: Tensor<B, 4>,
    /// Variance interpolation values in [-1, 1] when the model learns sigma
    pub var_values: Option<Tensor<B, 4>>,
}

/// A pretrained noise predictor
///
/// `timestep` is an index into the *base* (unrespaced) schedule and is the
/// same for every element of the batch. `classes` carries one label per batch
/// element for class-conditional models.
pub trait Denoiser<B: Backend> {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        timestep: usize,
        classes: Option<&[usize]>,
    ) -> DenoiserOutput<B>;

    /// Number of condition labels, `None` for unconditional models
    fn num_classes(&self) -> Option<usize>;

    /// Whether `forward` returns `var_values`
    fn learns_sigma(&self) -> bool {
        false
    }
}

/// Exact noise predictor for a Gaussian image prior
///
/// Images are modelled as `x0 ~ N(μ_y, s²·I)` with one mean colour per class.
/// Under the forward process `x_t = √ᾱ·x0 + √(1-ᾱ)·ε` the minimum-MSE
/// prediction is
///
/// ```text
/// E[ε | x_t] = √(1-ᾱ) · (x_t − √ᾱ·μ_y) / (ᾱ·s² + 1 − ᾱ)
/// ```
///
/// Built only from tensor arithmetic, so it is differentiable on any backend.
#[derive(Debug, Clone)]
pub struct AnalyticDenoiser {
    alphas_cumprod: Vec<f64>,
    class_means: Vec<[f32; 3]>,
    pixel_std: f64,
}

impl AnalyticDenoiser {
    /// Unconditional prior centred on mid-grey
    pub fn new(alphas_cumprod: Vec<f64>) -> Self {
        Self {
            alphas_cumprod,
            class_means: Vec::new(),
            pixel_std: 0.5,
        }
    }

    /// Class-conditional prior with a deterministic colour palette
    pub fn class_conditional(alphas_cumprod: Vec<f64>, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let class_means = (0..num_classes)
            .map(|_| {
                [
                    rng.gen_range(-0.6f32..0.6),
                    rng.gen_range(-0.6f32..0.6),
                    rng.gen_range(-0.6f32..0.6),
                ]
            })
            .collect();

        Self {
            alphas_cumprod,
            class_means,
            pixel_std: 0.3,
        }
    }

    pub fn with_pixel_std(mut self, pixel_std: f64) -> Self {
        self.pixel_std = pixel_std;
        self
    }

    /// Mean colour of a class, in [-1, 1]
    pub fn class_mean(&self, class: usize) -> Option<[f32; 3]> {
        self.class_means.get(class).copied()
    }

    fn means<B: Backend>(
        &self,
        classes: Option<&[usize]>,
        batch: usize,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let means: Vec<f32> = match classes {
            Some(labels) if !self.class_means.is_empty() => labels
                .iter()
                .flat_map(|&c| self.class_mean(c).unwrap_or([0.0; 3]))
                .collect(),
            _ => vec![0.0; batch * 3],
        };
        let rows = means.len() / 3;
        Tensor::from_data(TensorData::new(means, [rows, 3, 1, 1]), device)
    }
}

impl<B: Backend> Denoiser<B> for AnalyticDenoiser {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        timestep: usize,
        classes: Option<&[usize]>,
    ) -> DenoiserOutput<B> {
        let [batch, _, _, _] = x.dims();
        let t = timestep.min(self.alphas_cumprod.len().saturating_sub(1));
        let alpha_bar = self.alphas_cumprod.get(t).copied().unwrap_or(1.0);

        let mu = self.means::<B>(classes, batch, &x.device());
        let marginal_var = alpha_bar * self.pixel_std * self.pixel_std + 1.0 - alpha_bar;
        let scale = (1.0 - alpha_bar).sqrt() / marginal_var;

        let eps = (x - mu * alpha_bar.sqrt()) * scale;
        DenoiserOutput {
            eps,
            var_values: None,
        }
    }

    fn num_classes(&self) -> Option<usize> {
        if self.class_means.is_empty() {
            None
        } else {
            Some(self.class_means.len())
        }
    }
}
