//! burn-cgd: CLIP-guided diffusion in pure Rust
//!
//! Samples images from a pretrained diffusion denoiser while steering every
//! reverse step with the gradient of a CLIP similarity loss between the
//! current estimate and a text prompt.
//!
//! # Crates
//!
//! - [`core`]: errors, the [`Denoiser`](core::Denoiser) and
//!   [`Embedder`](core::Embedder) seams, reference collaborators
//! - [`samplers`]: noise schedules, respacing, DDPM/DDIM steps
//! - [`clip`]: CLIP variants, spherical distance, class ranking
//!
//! # Example
//!
//! ```ignore
//! use burn_cgd::backends::{default_device, GuidanceBackend};
//! use burn_cgd::{ClipGuidedDiffusion, RunConfig};
//!
//! let device = default_device();
//! let config = RunConfig::new("an oil painting of a lighthouse");
//! let pipeline = ClipGuidedDiffusion::<GuidanceBackend, _, _>::new(&unet, &clip, config, false, &device)?;
//! for snapshot in pipeline.sample(None, Default::default())? {
//!     let snapshot = snapshot?;
//!     // snapshot.pred_xstart is the current denoised estimate
//! }
//! ```

pub use burn_cgd_clip as clip;
pub use burn_cgd_core as core;
pub use burn_cgd_samplers as samplers;

pub mod backends;
pub mod config;
pub mod cutouts;
pub mod guidance;
pub mod noise;
pub mod pipeline;
pub mod sampling;
pub mod scorer;

pub use config::{RunConfig, DEFAULT_NUM_CLASSES, IMAGE_SIZES, STEP_COUNTS};
pub use cutouts::{Augmentation, AugmentationStep, CutoutConfig, MakeCutouts};
pub use guidance::GuidanceBridge;
pub use noise::gaussian_noise;
pub use pipeline::ClipGuidedDiffusion;
pub use sampling::{
    draw_class, ClassConditioning, ClassSelection, LoopConfig, LoopState, SamplingRun, Snapshot, StepKind,
};
pub use scorer::{tv_loss, DirectionalScorer, GuidanceConfig};
