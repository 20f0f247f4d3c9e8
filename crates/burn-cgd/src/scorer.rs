//! Directional CLIP loss for a rendered denoising estimate

use burn::prelude::*;
use burn_cgd_clip::{normalize, spherical_dist_loss};
use burn_cgd_core::{CgdError, Embedder, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::cutouts::MakeCutouts;

/// Loss weights for CLIP guidance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Weight of the spherical distance term
    pub guidance_scale: f64,
    /// Weight of the total-variation smoothness term
    pub tv_scale: f64,
    /// Weight of the anti-target distance that is subtracted
    pub anti_weight: f64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            guidance_scale: 1000.0,
            tv_scale: 100.0,
            anti_weight: 0.1,
        }
    }
}

impl GuidanceConfig {
    /// Whether the loss can produce a non-zero gradient
    ///
    /// The anti-target term is scaled by `guidance_scale`, so it alone never
    /// activates guidance.
    pub fn is_active(&self) -> bool {
        self.guidance_scale != 0.0 || self.tv_scale != 0.0
    }
}

/// Total variation per image: `mean_{c,h,w}(Δx² + Δy²)`
///
/// Differences are taken against a replicate-padded copy, so the last column
/// and row contribute zero. Returns shape `[n]`.
pub fn tv_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = x.dims();
    let device = x.device();
    let cells = (c * h * w) as f64;

    let mut total: Tensor<B, 2> = Tensor::zeros([n, 1], &device);
    if w > 1 {
        let dx = x.clone().slice([0..n, 0..c, 0..h, 1..w]) - x.clone().slice([0..n, 0..c, 0..h, 0..w - 1]);
        total = total + dx.powi_scalar(2).reshape([n, c * h * (w - 1)]).sum_dim(1);
    }
    if h > 1 {
        let dy = x.clone().slice([0..n, 0..c, 1..h, 0..w]) - x.slice([0..n, 0..c, 0..h - 1, 0..w]);
        total = total + dy.powi_scalar(2).reshape([n, c * (h - 1) * w]).sum_dim(1);
    }

    (total / cells).reshape([n])
}

/// Scores images by their distance to a target prompt embedding
pub struct DirectionalScorer<'a, B: Backend, E: ?Sized> {
    embedder: &'a E,
    cutouts: MakeCutouts,
    target: Tensor<B, 2>,
    anti_target: Option<Tensor<B, 2>>,
    config: GuidanceConfig,
}

impl<'a, B: Backend, E: Embedder<B> + ?Sized> DirectionalScorer<'a, B, E> {
    /// `target` and `anti_target` are `[1, dim]` text embeddings
    pub fn new(
        embedder: &'a E,
        cutouts: MakeCutouts,
        target: Tensor<B, 2>,
        anti_target: Option<Tensor<B, 2>>,
        config: GuidanceConfig,
    ) -> Result<Self> {
        let dim = embedder.embed_dim();
        for (name, embed) in std::iter::once(("target", &target)).chain(anti_target.iter().map(|a| ("anti-target", a))) {
            if embed.dims() != [1, dim] {
                return Err(CgdError::config(format!(
                    "{name} embedding has shape {:?}, expected [1, {dim}]",
                    embed.dims()
                )));
            }
        }
        if cutouts.cut_size() != embedder.input_resolution() {
            return Err(CgdError::config(format!(
                "cutout size {} does not match the embedder input resolution {}",
                cutouts.cut_size(),
                embedder.input_resolution()
            )));
        }

        Ok(Self {
            embedder,
            cutouts,
            target,
            anti_target,
            config,
        })
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    /// Single-element loss for a `[n, 3, h, w]` batch in [-1, 1]
    pub fn score(&self, x: Tensor<B, 4>, rng: &mut StdRng) -> Tensor<B, 1> {
        let [n, _, _, _] = x.dims();
        let num_cutouts = self.cutouts.num_cutouts();
        let dim = self.embedder.embed_dim();

        let clip_in = normalize((x.clone() + 1.0) / 2.0);
        let crops = self.cutouts.forward(clip_in, rng);
        let embeds = self
            .embedder
            .embed_image(crops)
            .reshape([num_cutouts, n, dim]);

        let mut dists = spherical_dist_loss(embeds.clone(), self.target.clone().reshape([1, 1, dim]));
        if let Some(anti) = &self.anti_target {
            let anti_dists = spherical_dist_loss(embeds, anti.clone().reshape([1, 1, dim]));
            dists = dists - anti_dists * self.config.anti_weight;
        }

        let clip_loss = dists.reshape([num_cutouts, n]).mean_dim(0).sum() * self.config.guidance_scale;
        let tv = tv_loss(x).sum() * self.config.tv_scale;
        clip_loss + tv
    }
}
