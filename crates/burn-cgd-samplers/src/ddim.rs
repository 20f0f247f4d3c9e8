//! DDIM (Denoising Diffusion Implicit Models) sampler
//!
//! Deterministic sampling when `eta = 0`; guidance enters through the score
//! (the noise prediction) rather than the posterior mean.

use burn::prelude::*;

use crate::ddpm::StepOutput;
use crate::diffusion::{GaussianDiffusion, MeanVariance};

/// Configuration for DDIM sampler
#[derive(Debug, Clone, Copy)]
pub struct DdimConfig {
    /// Eta parameter (0 = deterministic, 1 = DDPM-like)
    pub eta: f64,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self { eta: 0.0 }
    }
}

/// DDIM sampler
#[derive(Debug, Clone, Copy, Default)]
pub struct DdimSampler {
    config: DdimConfig,
}

impl DdimSampler {
    pub fn new(config: DdimConfig) -> Self {
        Self { config }
    }

    pub fn eta(&self) -> f64 {
        self.config.eta
    }

    /// Whether the step at `t` consumes a noise draw
    pub fn needs_noise(&self, t: usize) -> bool {
        t > 0 && self.config.eta > 0.0
    }

    /// σₜ = η · √((1−ᾱ_prev)/(1−ᾱₜ)) · √(1 − ᾱₜ/ᾱ_prev)
    pub fn sigma(&self, diffusion: &GaussianDiffusion, t: usize) -> f64 {
        let ab = diffusion.alpha_cumprod(t);
        let ab_prev = diffusion.alpha_cumprod_prev(t);
        self.config.eta * ((1.0 - ab_prev) / (1.0 - ab)).sqrt() * (1.0 - ab / ab_prev).sqrt()
    }

    /// Perform one DDIM step from a precomputed posterior
    pub fn step<B: Backend>(
        &self,
        diffusion: &GaussianDiffusion,
        out: MeanVariance<B>,
        x: Tensor<B, 4>,
        t: usize,
        grad: Option<Tensor<B, 4>>,
        noise: Option<Tensor<B, 4>>,
    ) -> StepOutput<B> {
        let out = match grad {
            Some(grad) => diffusion.condition_score(out, x.clone(), t, grad),
            None => out,
        };

        // Recomputed so a clipped x̂₀ stays consistent with the noise estimate
        let eps = diffusion.predict_eps_from_xstart(x, t, out.pred_xstart.clone());

        let ab_prev = diffusion.alpha_cumprod_prev(t);
        let sigma = self.sigma(diffusion, t);
        let dir_coef = (1.0 - ab_prev - sigma * sigma).max(0.0).sqrt();

        let mean_pred = out.pred_xstart.clone() * ab_prev.sqrt() + eps * dir_coef;
        let sample = match noise {
            Some(noise) if self.needs_noise(t) => mean_pred + noise * sigma,
            _ => mean_pred,
        };

        StepOutput {
            sample,
            pred_xstart: out.pred_xstart,
        }
    }
}
