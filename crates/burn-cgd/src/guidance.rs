//! Image-space gradient of the CLIP loss
//!
//! The sampling loop runs on a plain backend; only this bridge lifts the
//! batch into the autodiff backend, so the computation graph lives for
//! exactly one call.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_cgd_core::{catch_oom, CgdError, Denoiser, Embedder, Result};
use burn_cgd_samplers::GaussianDiffusion;
use rand::rngs::StdRng;

use crate::scorer::DirectionalScorer;

/// Computes `-∇ₓ loss` for the current noisy batch
pub struct GuidanceBridge<'a, A: AutodiffBackend, M: ?Sized, E: ?Sized> {
    diffusion: &'a GaussianDiffusion,
    model: &'a M,
    scorer: DirectionalScorer<'a, A, E>,
}

impl<'a, A, M, E> GuidanceBridge<'a, A, M, E>
where
    A: AutodiffBackend,
    M: Denoiser<A> + ?Sized,
    E: Embedder<A> + ?Sized,
{
    pub fn new(diffusion: &'a GaussianDiffusion, model: &'a M, scorer: DirectionalScorer<'a, A, E>) -> Self {
        Self {
            diffusion,
            model,
            scorer,
        }
    }

    pub fn scorer(&self) -> &DirectionalScorer<'a, A, E> {
        &self.scorer
    }

    /// Negated loss gradient with respect to `x` at respaced timestep `t`
    ///
    /// Backend out-of-memory panics become [`CgdError::OutOfMemory`]; any
    /// other panic is re-raised.
    pub fn gradient(
        &self,
        x: Tensor<A::InnerBackend, 4>,
        t: usize,
        classes: Option<&[usize]>,
        rng: &mut StdRng,
    ) -> Result<Tensor<A::InnerBackend, 4>> {
        catch_oom("guidance", || self.gradient_unguarded(x, t, classes, rng))
    }

    fn gradient_unguarded(
        &self,
        x: Tensor<A::InnerBackend, 4>,
        t: usize,
        classes: Option<&[usize]>,
        rng: &mut StdRng,
    ) -> Result<Tensor<A::InnerBackend, 4>> {
        let x = Tensor::<A, 4>::from_inner(x).require_grad();

        let out = self
            .diffusion
            .p_mean_variance(self.model, x.clone(), t, classes, false);
        let fac = self.diffusion.sqrt_one_minus_alpha_cumprod(t);
        let x_in = out.pred_xstart * fac + x.clone() * (1.0 - fac);

        let loss = self.scorer.score(x_in, rng);
        let grads = loss.backward();
        let grad = x
            .grad(&grads)
            .ok_or_else(|| CgdError::Tensor("loss gradient did not reach the sample".into()))?;

        Ok(grad.neg())
    }
}
