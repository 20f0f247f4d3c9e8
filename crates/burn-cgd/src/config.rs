//! Run configuration and up-front validation

use burn_cgd_clip::ClipVariant;
use burn_cgd_core::{CgdError, DebugConfig, Result};
use burn_cgd_samplers::{BetaSchedule, NoiseSchedule, Respacing};
use serde::{Deserialize, Serialize};

use crate::cutouts::{AugmentationStep, CutoutConfig};
use crate::sampling::{LoopConfig, StepKind};
use crate::scorer::GuidanceConfig;

/// Sampling step counts the pretrained checkpoints support
pub const STEP_COUNTS: [usize; 6] = [25, 50, 100, 250, 500, 1000];

/// Image sizes with pretrained checkpoints
pub const IMAGE_SIZES: [usize; 4] = [64, 128, 256, 512];

/// Classes of the class-conditional checkpoints (ImageNet)
pub const DEFAULT_NUM_CLASSES: usize = 1000;

/// Every knob of a guided sampling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub prompt: String,
    /// Prompt to steer away from
    pub prompt_min: Option<String>,
    /// Weight of `prompt_min`, in [0, 1]
    pub min_weight: f64,
    pub batch_size: usize,
    pub tv_scale: f64,
    /// Keep only the best-scoring classes; `None` keeps all
    pub top_n: Option<usize>,
    pub image_size: usize,
    pub class_cond: bool,
    pub clip_guidance_scale: f64,
    pub cutout_power: f64,
    pub num_cutouts: usize,
    pub timestep_respacing: Respacing,
    pub diffusion_steps: usize,
    pub skip_timesteps: usize,
    pub seed: u64,
    pub clip_model: ClipVariant,
    /// Draw classes in proportion to their CLIP score instead of uniformly
    pub class_score: bool,
    pub augmentations: Vec<AugmentationStep>,
    pub clip_denoised: bool,
    pub randomize_class: bool,
    pub num_classes: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            prompt_min: None,
            min_weight: 0.1,
            batch_size: 1,
            tv_scale: 100.0,
            top_n: None,
            image_size: 128,
            class_cond: true,
            clip_guidance_scale: 1000.0,
            cutout_power: 1.0,
            num_cutouts: 16,
            timestep_respacing: Respacing::Sections(vec![1000]),
            diffusion_steps: 1000,
            skip_timesteps: 0,
            seed: 0,
            clip_model: ClipVariant::VitB32,
            class_score: false,
            augmentations: Vec::new(),
            clip_denoised: true,
            randomize_class: true,
            num_classes: DEFAULT_NUM_CLASSES,
        }
    }
}

impl RunConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Number of sampling steps after respacing
    pub fn respaced_steps(&self) -> usize {
        self.timestep_respacing.count()
    }

    /// Anti-prompt, ignoring empty strings
    pub fn anti_prompt(&self) -> Option<&str> {
        self.prompt_min.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// 64px checkpoints were trained on the cosine schedule
    pub fn beta_schedule(&self) -> BetaSchedule {
        if self.image_size == 64 {
            BetaSchedule::Cosine
        } else {
            BetaSchedule::Linear
        }
    }

    pub fn base_schedule(&self) -> NoiseSchedule {
        NoiseSchedule::new(self.beta_schedule(), self.diffusion_steps)
    }

    pub fn step_kind(&self) -> StepKind {
        StepKind::for_respacing(&self.timestep_respacing)
    }

    pub fn guidance_config(&self) -> GuidanceConfig {
        GuidanceConfig {
            guidance_scale: self.clip_guidance_scale,
            tv_scale: self.tv_scale,
            anti_weight: self.min_weight,
        }
    }

    pub fn cutout_config(&self, cut_size: usize) -> CutoutConfig {
        CutoutConfig::new(cut_size, self.num_cutouts)
            .with_power(self.cutout_power)
            .with_augmentations(self.augmentations.clone())
    }

    pub fn loop_config(&self, debug: DebugConfig) -> LoopConfig {
        LoopConfig {
            kind: self.step_kind(),
            batch_size: self.batch_size,
            image_size: self.image_size,
            skip_timesteps: self.skip_timesteps,
            clip_denoised: self.clip_denoised,
            seed: self.seed,
            debug,
        }
    }

    /// Check every setting before any model is touched
    pub fn validate(&self, has_seed_image: bool) -> Result<()> {
        let steps = self.respaced_steps();
        let respacing_ok = match &self.timestep_respacing {
            Respacing::Sections(counts) => counts.len() == 1 && STEP_COUNTS.contains(&counts[0]),
            Respacing::Ddim(n) => STEP_COUNTS.contains(n),
        };
        if !respacing_ok {
            return Err(CgdError::config(format!(
                "timestep respacing '{}' should be one of {:?}, optionally prefixed with 'ddim'",
                self.timestep_respacing, STEP_COUNTS
            )));
        }
        if !STEP_COUNTS.contains(&self.diffusion_steps) {
            return Err(CgdError::config(format!(
                "diffusion steps should be one of {:?}, got {}",
                STEP_COUNTS, self.diffusion_steps
            )));
        }
        if steps > self.diffusion_steps {
            return Err(CgdError::config(format!(
                "timestep respacing '{}' has more steps than the {} diffusion steps",
                self.timestep_respacing, self.diffusion_steps
            )));
        }
        if !IMAGE_SIZES.contains(&self.image_size) {
            return Err(CgdError::config(format!(
                "image size should be one of {:?}, got {}",
                IMAGE_SIZES, self.image_size
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(CgdError::config("prompt can't be empty"));
        }
        if self.batch_size == 0 {
            return Err(CgdError::config("batch size must be greater than zero"));
        }
        if self.num_cutouts == 0 {
            return Err(CgdError::config("number of cutouts must be greater than zero"));
        }
        if let Some(top_n) = self.top_n {
            if top_n == 0 || top_n > self.num_classes {
                return Err(CgdError::config(format!(
                    "top_n must be between 1 and the number of classes ({}), got {top_n}",
                    self.num_classes
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.min_weight) {
            return Err(CgdError::config(format!(
                "min_weight must be between 0 and 1, got {}",
                self.min_weight
            )));
        }
        if !self.class_cond && self.image_size != 256 {
            return Err(CgdError::config(
                "image size must be 256 when class conditioning is disabled",
            ));
        }

        if has_seed_image {
            if self.skip_timesteps == 0 || self.skip_timesteps >= steps {
                return Err(CgdError::config(format!(
                    "skip_timesteps (currently {}) must be greater than 0 and less than the respaced step count ({steps}) when an init image is given",
                    self.skip_timesteps
                )));
            }
            if self.timestep_respacing.is_ddim() {
                return Err(CgdError::config(
                    "init images are not supported with ddim respacing",
                ));
            }
        } else if self.skip_timesteps != 0 {
            return Err(CgdError::config(
                "skip_timesteps must be 0 when no init image is given",
            ));
        }

        // Cutout power and augmentations; the size is checked later
        self.cutout_config(1).validate()?;

        if self.class_score && !self.class_cond {
            tracing::warn!("class_score has no effect without class conditioning");
        }
        Ok(())
    }
}
