//! Gaussian diffusion arithmetic over a (possibly respaced) schedule
//!
//! Splits the diffusion model into the network ([`Denoiser`]) and the
//! schedule-dependent posterior maths here. Timesteps passed to
//! [`GaussianDiffusion`] are indices into the respaced schedule; they are
//! mapped back to the base schedule before the network sees them.

use burn::prelude::*;
use burn_cgd_core::{CgdError, Denoiser};

use crate::scheduler::{NoiseSchedule, Respacing};

/// How the reverse-process variance is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarianceType {
    /// Posterior variance β̃ₜ
    FixedSmall,
    /// βₜ (with β̃₁ at the first step)
    FixedLarge,
    /// The model predicts the log variance directly
    Learned,
    /// The model interpolates between log β̃ₜ and log βₜ
    #[default]
    LearnedRange,
}

impl VarianceType {
    /// Learned range for models that predict variance values, fixed large otherwise
    pub fn for_model(learns_sigma: bool) -> Self {
        if learns_sigma {
            VarianceType::LearnedRange
        } else {
            VarianceType::FixedLarge
        }
    }
}

/// Posterior mean and variance for one reverse step
pub struct MeanVariance<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub variance: Tensor<B, 4>,
    pub log_variance: Tensor<B, 4>,
    /// Denoised estimate x̂₀
    pub pred_xstart: Tensor<B, 4>,
    /// Predicted noise
    pub eps: Tensor<B, 4>,
}

/// Schedule-derived quantities for sampling a diffusion model
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    timestep_map: Vec<usize>,
    variance_type: VarianceType,
}

impl GaussianDiffusion {
    /// Respace `base` and precompute the posterior quantities
    pub fn new(base: &NoiseSchedule, respacing: &Respacing) -> Result<Self, CgdError> {
        let keep = respacing.timesteps(base.num_steps())?;
        let (schedule, timestep_map) = base.respace(&keep);
        tracing::debug!(
            respacing = %respacing,
            base_steps = base.num_steps(),
            steps = schedule.num_steps(),
            "respaced diffusion schedule"
        );
        Ok(Self::with_timestep_map(schedule, timestep_map))
    }

    fn with_timestep_map(schedule: NoiseSchedule, timestep_map: Vec<usize>) -> Self {
        let NoiseSchedule {
            betas,
            alphas_cumprod,
        } = schedule;
        let n = betas.len();

        let mut alphas_cumprod_prev = Vec::with_capacity(n);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..n.saturating_sub(1)]);

        let mut posterior_variance = Vec::with_capacity(n);
        let mut coef1 = Vec::with_capacity(n);
        let mut coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let ab = alphas_cumprod[t];
            let ab_prev = alphas_cumprod_prev[t];
            let alpha = 1.0 - betas[t];
            posterior_variance.push(betas[t] * (1.0 - ab_prev) / (1.0 - ab));
            coef1.push(betas[t] * ab_prev.sqrt() / (1.0 - ab));
            coef2.push((1.0 - ab_prev) * alpha.sqrt() / (1.0 - ab));
        }

        // The posterior variance is 0 at t = 0, so the log is clipped to the next value
        let first = posterior_variance.get(1).copied().unwrap_or(betas[0]);
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .enumerate()
            .map(|(t, &v)| if t == 0 { first.ln() } else { v.ln() })
            .collect();

        Self {
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1: coef1,
            posterior_mean_coef2: coef2,
            timestep_map,
            variance_type: VarianceType::default(),
        }
    }

    pub fn with_variance_type(mut self, variance_type: VarianceType) -> Self {
        self.variance_type = variance_type;
        self
    }

    pub fn variance_type(&self) -> VarianceType {
        self.variance_type
    }

    /// Number of (respaced) sampling timesteps
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// Map from respaced index to base-schedule index
    pub fn timestep_map(&self) -> &[usize] {
        &self.timestep_map
    }

    /// Base-schedule timestep the network is queried with at respaced `t`
    pub fn model_timestep(&self, t: usize) -> usize {
        self.timestep_map[t]
    }

    pub fn beta(&self, t: usize) -> f64 {
        self.betas[t]
    }

    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    pub fn alpha_cumprod_prev(&self, t: usize) -> f64 {
        self.alphas_cumprod_prev[t]
    }

    pub fn sqrt_one_minus_alpha_cumprod(&self, t: usize) -> f64 {
        (1.0 - self.alphas_cumprod[t]).sqrt()
    }

    /// Forward-noise `x_start` to timestep `t`
    pub fn q_sample<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        t: usize,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let ab = self.alphas_cumprod[t];
        x_start * ab.sqrt() + noise * (1.0 - ab).sqrt()
    }

    /// Mean of q(x_{t-1} | x_t, x_0)
    pub fn q_posterior_mean<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        t: usize,
    ) -> Tensor<B, 4> {
        x_start * self.posterior_mean_coef1[t] + x_t * self.posterior_mean_coef2[t]
    }

    pub fn predict_xstart_from_eps<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: usize,
        eps: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let ab = self.alphas_cumprod[t];
        x_t * (1.0 / ab).sqrt() - eps * (1.0 / ab - 1.0).sqrt()
    }

    pub fn predict_eps_from_xstart<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: usize,
        pred_xstart: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let ab = self.alphas_cumprod[t];
        (x_t * (1.0 / ab).sqrt() - pred_xstart) / (1.0 / ab - 1.0).sqrt()
    }

    /// Query the network at respaced timestep `t` and form p(x_{t-1} | x_t)
    pub fn p_mean_variance<B: Backend, M: Denoiser<B> + ?Sized>(
        &self,
        model: &M,
        x: Tensor<B, 4>,
        t: usize,
        classes: Option<&[usize]>,
        clip_denoised: bool,
    ) -> MeanVariance<B> {
        let out = model.forward(x.clone(), self.model_timestep(t), classes);
        let (variance, log_variance) = self.variance(&x, t, out.var_values);

        let pred_xstart = self.predict_xstart_from_eps(x.clone(), t, out.eps.clone());
        let pred_xstart = if clip_denoised {
            pred_xstart.clamp(-1.0, 1.0)
        } else {
            pred_xstart
        };
        let mean = self.q_posterior_mean(pred_xstart.clone(), x, t);

        MeanVariance {
            mean,
            variance,
            log_variance,
            pred_xstart,
            eps: out.eps,
        }
    }

    fn variance<B: Backend>(
        &self,
        x: &Tensor<B, 4>,
        t: usize,
        var_values: Option<Tensor<B, 4>>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        match (self.variance_type, var_values) {
            (VarianceType::Learned, Some(log_variance)) => (log_variance.clone().exp(), log_variance),
            (VarianceType::LearnedRange, Some(v)) => {
                let min_log = self.posterior_log_variance_clipped[t];
                let max_log = self.betas[t].ln();
                let frac = (v + 1.0) / 2.0;
                let log_variance = frac.clone() * max_log + (frac.neg() + 1.0) * min_log;
                (log_variance.clone().exp(), log_variance)
            }
            (VarianceType::FixedSmall, _) => self.fixed_variance(
                x,
                self.posterior_variance[t],
                self.posterior_log_variance_clipped[t],
            ),
            _ => {
                // Fixed large, also the fallback when a learned model gives no values
                let v = if t == 0 {
                    self.posterior_variance.get(1).copied().unwrap_or(self.betas[0])
                } else {
                    self.betas[t]
                };
                self.fixed_variance(x, v, v.ln())
            }
        }
    }

    fn fixed_variance<B: Backend>(
        &self,
        x: &Tensor<B, 4>,
        variance: f64,
        log_variance: f64,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let device = x.device();
        let dims = x.dims();
        (
            Tensor::full(dims, variance as f32, &device),
            Tensor::full(dims, log_variance as f32, &device),
        )
    }

    /// Shift the posterior mean along a gradient: `mean + variance · grad`
    pub fn condition_mean<B: Backend>(&self, out: &MeanVariance<B>, grad: Tensor<B, 4>) -> Tensor<B, 4> {
        out.mean.clone() + out.variance.clone() * grad
    }

    /// Fold a gradient into the noise prediction and recompute the estimates
    ///
    /// `eps' = eps − √(1−ᾱₜ) · grad`, then x̂₀ and the mean follow from `eps'`.
    pub fn condition_score<B: Backend>(
        &self,
        out: MeanVariance<B>,
        x: Tensor<B, 4>,
        t: usize,
        grad: Tensor<B, 4>,
    ) -> MeanVariance<B> {
        let eps = self.predict_eps_from_xstart(x.clone(), t, out.pred_xstart);
        let eps = eps - grad * self.sqrt_one_minus_alpha_cumprod(t);
        let pred_xstart = self.predict_xstart_from_eps(x.clone(), t, eps.clone());
        let mean = self.q_posterior_mean(pred_xstart.clone(), x, t);

        MeanVariance {
            mean,
            variance: out.variance,
            log_variance: out.log_variance,
            pred_xstart,
            eps,
        }
    }
}
