//! Ranking class labels by CLIP similarity to a prompt

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn_cgd_core::{CgdError, Embedder, Result};

/// Ordered (class, probability) pairs, highest probability first
///
/// Probabilities come from a softmax over the full label set, so after
/// truncation to the top entries they sum to at most 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights {
    entries: Vec<(usize, f32)>,
}

impl ClassWeights {
    /// Build a table, sorting entries by descending probability
    pub fn new(mut entries: Vec<(usize, f32)>) -> Result<Self> {
        if entries.is_empty() {
            return Err(CgdError::config("class weight table is empty"));
        }
        if entries.iter().any(|(_, p)| !p.is_finite() || *p < 0.0) {
            return Err(CgdError::config("class probabilities must be finite and non-negative"));
        }
        entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, f32)> {
        self.entries.iter()
    }

    pub fn classes(&self) -> Vec<usize> {
        self.entries.iter().map(|&(c, _)| c).collect()
    }

    pub fn probabilities(&self) -> Vec<f32> {
        self.entries.iter().map(|&(_, p)| p).collect()
    }

    /// Largest class index in the table, not the top-ranked class
    pub fn largest_class_index(&self) -> usize {
        self.entries.iter().map(|&(c, _)| c).max().unwrap_or(0)
    }
}

/// Rank `labels` by similarity to `prompt`, optionally pushed away from
/// `anti_prompt`
///
/// The anti-prompt embedding is subtracted with weight `anti_weight` and the
/// result is not renormalised. Returns the top `min(top_n, labels.len())`
/// classes.
pub fn rank_classes<B: Backend, E: Embedder<B> + ?Sized>(
    embedder: &E,
    labels: &[String],
    prompt: &str,
    anti_prompt: Option<&str>,
    anti_weight: f64,
    top_n: usize,
    device: &B::Device,
) -> Result<ClassWeights> {
    if labels.is_empty() {
        return Err(CgdError::config("cannot rank an empty label set"));
    }
    if top_n == 0 {
        return Err(CgdError::config("top_n must be at least 1"));
    }

    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
    let label_embeds = embedder.embed_text(&label_refs, device);

    let mut prompt_embed = embedder.embed_text(&[prompt], device);
    if let Some(anti) = anti_prompt.filter(|a| !a.is_empty()) {
        prompt_embed = prompt_embed - embedder.embed_text(&[anti], device) * anti_weight;
    }

    let logits = prompt_embed.matmul(label_embeds.transpose()) * 100.0;
    let probs: Vec<f32> = softmax(logits, 1).into_data().convert::<f32>().to_vec()?;

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    let entries: Vec<(usize, f32)> = order
        .into_iter()
        .take(top_n.min(labels.len()))
        .map(|i| (i, probs[i]))
        .collect();

    if let Some(&(class, prob)) = entries.first() {
        tracing::info!(
            top_class = class,
            label = %labels[class],
            probability = prob,
            ranked = entries.len(),
            "ranked classes by prompt similarity"
        );
    }

    ClassWeights::new(entries)
}
