//! Diffusion schedules and samplers for CLIP-guided diffusion
//!
//! - [`scheduler`] - beta schedules and timestep respacing
//! - [`diffusion`] - posterior quantities and guidance conditioning
//! - [`ddpm`] / [`ddim`] - single reverse steps

pub mod ddim;
pub mod ddpm;
pub mod diffusion;
pub mod scheduler;

pub use ddim::{DdimConfig, DdimSampler};
pub use ddpm::{DdpmSampler, StepOutput};
pub use diffusion::{GaussianDiffusion, MeanVariance, VarianceType};
pub use scheduler::{space_timesteps, BetaSchedule, NoiseSchedule, Respacing};
