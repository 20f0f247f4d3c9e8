//! CLIP-side components for guided diffusion
//!
//! - [`ClipVariant`] - supported checkpoints with their input resolution and
//!   embedding width
//! - [`ProjectionEmbedder`] - a self-contained [`Embedder`](burn_cgd_core::Embedder)
//!   that runs without downloaded weights
//! - [`spherical_dist_loss`] - the guidance distance
//! - [`rank_classes`] - class-weight tables for class-conditional models
//!
//! # Example
//!
//! ```ignore
//! use burn_cgd_clip::{rank_classes, ClipVariant, ProjectionEmbedder};
//!
//! let embedder = ProjectionEmbedder::new(ClipVariant::VitB32, 0);
//! let weights = rank_classes(&embedder, &labels, "a red fox", None, 0.1, 10, &device)?;
//! ```

pub mod embedder;
pub mod loss;
pub mod ranking;
pub mod variant;

pub use embedder::{colour_of, normalize, words, ProjectionEmbedder, CLIP_MEAN, CLIP_STD};
pub use loss::{asin_unit, spherical_dist_loss};
pub use ranking::{rank_classes, ClassWeights};
pub use variant::ClipVariant;
