//! DDPM (Denoising Diffusion Probabilistic Models) sampler
//!
//! Ancestral sampling: each step draws x_{t-1} from the Gaussian posterior,
//! with guidance applied as a shift of the posterior mean.

use burn::prelude::*;

use crate::diffusion::{GaussianDiffusion, MeanVariance};

/// Result of one reverse step
pub struct StepOutput<B: Backend> {
    /// x_{t-1}
    pub sample: Tensor<B, 4>,
    /// Denoised estimate used for the step
    pub pred_xstart: Tensor<B, 4>,
}

/// DDPM ancestral sampler
#[derive(Debug, Clone, Copy, Default)]
pub struct DdpmSampler;

impl DdpmSampler {
    pub fn new() -> Self {
        Self
    }

    /// Whether the step at `t` consumes a noise draw
    pub fn needs_noise(&self, t: usize) -> bool {
        t > 0
    }

    /// Perform one DDPM step from a precomputed posterior
    ///
    /// `grad` is the guidance gradient (already negated, pointing uphill in
    /// log-likelihood). `noise` must be present when [`Self::needs_noise`].
    pub fn step<B: Backend>(
        &self,
        diffusion: &GaussianDiffusion,
        out: MeanVariance<B>,
        t: usize,
        grad: Option<Tensor<B, 4>>,
        noise: Option<Tensor<B, 4>>,
    ) -> StepOutput<B> {
        let mean = match grad {
            Some(grad) => diffusion.condition_mean(&out, grad),
            None => out.mean,
        };

        let sample = match noise {
            Some(noise) if self.needs_noise(t) => mean + (out.log_variance * 0.5).exp() * noise,
            _ => mean,
        };

        StepOutput {
            sample,
            pred_xstart: out.pred_xstart,
        }
    }
}
