//! Spherical distance between embeddings

use burn::prelude::*;
use burn_cgd_core::l2_normalize;

/// Abramowitz & Stegun 4.4.46 coefficients, highest order first
const ASIN_COEFFS: [f64; 8] = [
    -0.0012624911,
    0.0066700901,
    -0.0170881256,
    0.0308918810,
    -0.0501743046,
    0.0889789874,
    -0.2145988016,
    1.5707963050,
];

/// `asin(x)` for `x` in [0, 1], built from differentiable primitives
///
/// `asin(x) = π/2 − √(1−x)·P(x)` with |error| ≤ 2e-8. Inputs are clamped to
/// [0, 1 − 1e-6] so the gradient stays finite.
pub fn asin_unit<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let x = x.clamp(0.0, 1.0 - 1e-6);
    let mut poly = x.zeros_like() + ASIN_COEFFS[0];
    for &c in &ASIN_COEFFS[1..] {
        poly = poly * x.clone() + c;
    }
    let root = (x.neg() + 1.0).sqrt();
    (root * poly).neg() + std::f64::consts::FRAC_PI_2
}

/// Half squared geodesic angle between `x` and `y` along the last dimension
///
/// Both sides are unit-normalised first; `y` broadcasts against `x`. The
/// result keeps the reduced dimension with size 1.
pub fn spherical_dist_loss<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    y: Tensor<B, D>,
) -> Tensor<B, D> {
    let x = l2_normalize(x, D - 1);
    let y = l2_normalize(y, D - 1);
    // Offset keeps the norm's gradient finite when x == y
    let chord = ((x - y).powi_scalar(2).sum_dim(D - 1) + 1e-12).sqrt();
    asin_unit(chord / 2.0).powi_scalar(2) * 2.0
}
