//! Numerical diagnostics for the sampling loop

use burn::prelude::*;

/// Debug flags for sampler diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugConfig {
    /// Log per-step tensor statistics
    pub sampler: bool,
    /// Panic on NaN/Inf values in tensors
    pub nan: bool,
}

/// Summarise a tensor as min/max/mean/std with NaN and Inf counts
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let data = tensor.clone().into_data();
    let Ok(floats) = data.convert::<f32>().to_vec::<f32>() else {
        return "unavailable".to_string();
    };

    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;
    let std = var.sqrt();

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min, max, mean, std, nan_count, inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min, max, mean, std
        )
    }
}

/// Check tensor for NaN/Inf values
///
/// When `enabled` is true, this will panic if NaN or Inf is detected.
#[inline]
pub fn check_tensor_if<B: Backend, const D: usize>(tensor: &Tensor<B, D>, name: &str, enabled: bool) {
    if !enabled {
        return;
    }

    let data = tensor.clone().into_data();
    let Ok(floats) = data.convert::<f32>().to_vec::<f32>() else {
        return;
    };

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();

    if nan_count > 0 || inf_count > 0 {
        let total = floats.len();
        tracing::error!(tensor = name, nan_count, inf_count, total, "non-finite values");
        panic!(
            "[NaN check failed] {}: {}/{} values are NaN, {}/{} are Inf\nStats: {}",
            name,
            nan_count,
            total,
            inf_count,
            total,
            tensor_stats(tensor)
        );
    }
}
