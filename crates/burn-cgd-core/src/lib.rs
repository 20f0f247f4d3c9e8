//! Core interfaces for CLIP-guided diffusion
//!
//! This crate holds what every other crate in the workspace agrees on:
//!
//! - [`denoiser`] - the noise-prediction network interface and an analytic
//!   reference model
//! - [`embedder`] - the joint text/image embedding interface
//! - [`error`] - the shared [`CgdError`] taxonomy
//! - [`debug`] - tensor statistics and NaN checks
//! - [`image`] - RGB byte conversions for persistence

pub mod debug;
pub mod denoiser;
pub mod embedder;
pub mod error;
pub mod image;

pub use debug::{check_tensor_if, tensor_stats, DebugConfig};
pub use denoiser::{AnalyticDenoiser, Denoiser, DenoiserOutput};
pub use embedder::{l2_normalize, Embedder};
pub use error::{catch_oom, is_oom_message, panic_message, CgdError, Result, OOM_HINTS};
pub use image::{rgb_to_tensor, tensor_to_rgb};
