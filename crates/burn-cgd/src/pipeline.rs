//! End-to-end setup of a CLIP-guided sampling run
//!
//! [`ClipGuidedDiffusion`] validates a [`RunConfig`], builds the respaced
//! diffusion, and wires the denoiser and embedder into a [`SamplingRun`].

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_cgd_clip::{rank_classes, ClassWeights};
use burn_cgd_core::{CgdError, DebugConfig, Denoiser, Embedder, Result};
use burn_cgd_samplers::{GaussianDiffusion, VarianceType};

use crate::config::RunConfig;
use crate::cutouts::MakeCutouts;
use crate::guidance::GuidanceBridge;
use crate::sampling::{ClassConditioning, ClassSelection, SamplingRun};
use crate::scorer::DirectionalScorer;

/// A denoiser and an embedder, ready to sample from a prompt
pub struct ClipGuidedDiffusion<'a, A: AutodiffBackend, M: ?Sized, E: ?Sized> {
    model: &'a M,
    embedder: &'a E,
    diffusion: GaussianDiffusion,
    config: RunConfig,
    labels: Option<Vec<String>>,
    device: A::Device,
}

impl<'a, A, M, E> ClipGuidedDiffusion<'a, A, M, E>
where
    A: AutodiffBackend,
    M: Denoiser<A> + Denoiser<A::InnerBackend> + ?Sized,
    E: Embedder<A> + ?Sized,
{
    /// Fails with [`CgdError::Config`] before touching either model
    pub fn new(
        model: &'a M,
        embedder: &'a E,
        config: RunConfig,
        has_seed_image: bool,
        device: &A::Device,
    ) -> Result<Self> {
        config.validate(has_seed_image)?;

        let learns_sigma = Denoiser::<A::InnerBackend>::learns_sigma(model);
        let diffusion = GaussianDiffusion::new(&config.base_schedule(), &config.timestep_respacing)?
            .with_variance_type(VarianceType::for_model(learns_sigma));

        Ok(Self {
            model,
            embedder,
            diffusion,
            config,
            labels: None,
            device: device.clone(),
        })
    }

    /// Human-readable class names, required by `class_score`
    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.config.num_classes {
            return Err(CgdError::config(format!(
                "expected {} class labels, got {}",
                self.config.num_classes,
                labels.len()
            )));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Classes ranked by CLIP similarity to the prompt
    ///
    /// Fails with [`CgdError::Config`] when no labels were supplied.
    pub fn rank_classes(&self) -> Result<ClassWeights> {
        let labels = self
            .labels
            .as_deref()
            .ok_or_else(|| CgdError::config("class_score needs class labels"))?;
        let top_n = self.config.top_n.unwrap_or(labels.len());
        rank_classes(
            self.embedder,
            labels,
            &self.config.prompt,
            self.config.anti_prompt(),
            self.config.min_weight,
            top_n,
            &self.device,
        )
    }

    fn conditioning(&self) -> Result<Option<ClassConditioning>> {
        if !self.config.class_cond {
            return Ok(None);
        }
        let selection = if self.config.class_score {
            ClassSelection::Weighted(self.rank_classes()?)
        } else {
            let num_classes = Denoiser::<A::InnerBackend>::num_classes(self.model).unwrap_or(self.config.num_classes);
            ClassSelection::Uniform { num_classes }
        };
        Ok(Some(ClassConditioning {
            selection,
            randomize: self.config.randomize_class,
        }))
    }

    fn bridge(&self) -> Result<Option<GuidanceBridge<'_, A, M, E>>> {
        let guidance = self.config.guidance_config();
        if !guidance.is_active() {
            tracing::info!("guidance and tv scales are zero, sampling without CLIP");
            return Ok(None);
        }

        let target: Tensor<A, 2> = self.embedder.embed_text(&[self.config.prompt.as_str()], &self.device);
        let anti_target: Option<Tensor<A, 2>> = self
            .config
            .anti_prompt()
            .map(|anti| self.embedder.embed_text(&[anti], &self.device));

        let cutouts = MakeCutouts::new(self.config.cutout_config(self.embedder.input_resolution()))?;
        let scorer = DirectionalScorer::new(self.embedder, cutouts, target, anti_target, guidance)?;
        Ok(Some(GuidanceBridge::new(&self.diffusion, self.model, scorer)))
    }

    /// Start a run; the prompt is embedded once here
    ///
    /// `init_image` must be in [-1, 1] with the configured image size.
    pub fn sample(
        &self,
        init_image: Option<Tensor<A::InnerBackend, 4>>,
        debug: DebugConfig,
    ) -> Result<SamplingRun<'_, A, M, E>> {
        self.config.validate(init_image.is_some())?;

        let conditioning = self.conditioning()?;
        let bridge = self.bridge()?;

        SamplingRun::new(
            &self.diffusion,
            self.model,
            bridge,
            conditioning,
            self.config.loop_config(debug),
            init_image,
            &self.device,
        )
    }
}
