//! Joint text/image embedding interface

use burn::prelude::*;

/// A pretrained multimodal embedding model (CLIP-like)
///
/// Both towers return one unit-length row per input. Parameters are never
/// mutated, so a single instance can be shared by reference across a run.
pub trait Embedder<B: Backend> {
    /// Side length of the square images `embed_image` expects
    fn input_resolution(&self) -> usize;

    /// Width of the embedding space
    fn embed_dim(&self) -> usize;

    /// Embed a batch of strings: `[texts.len(), embed_dim]`
    fn embed_text(&self, texts: &[&str], device: &B::Device) -> Tensor<B, 2>;

    /// Embed already-normalised images `[n, 3, r, r]`: `[n, embed_dim]`
    fn embed_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Scale rows of `x` along `dim` to unit L2 norm
pub fn l2_normalize<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let norm = x.clone().powi_scalar(2).sum_dim(dim).sqrt().clamp_min(1e-12);
    x / norm
}
