//! Seeded Gaussian noise

use burn::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Standard normal tensor drawn from `rng`
///
/// Noise is generated host-side so that a seed reproduces a run on any
/// backend.
pub fn gaussian_noise<B: Backend, const D: usize>(
    rng: &mut StdRng,
    dims: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let len = dims.iter().product();
    let values: Vec<f32> = (0..len).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_noise() {
        let device = Default::default();
        let a: Tensor<TestBackend, 4> =
            gaussian_noise(&mut StdRng::seed_from_u64(5), [1, 3, 4, 4], &device);
        let b: Tensor<TestBackend, 4> =
            gaussian_noise(&mut StdRng::seed_from_u64(5), [1, 3, 4, 4], &device);
        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_noise_statistics() {
        let device = Default::default();
        let x: Tensor<TestBackend, 1> =
            gaussian_noise(&mut StdRng::seed_from_u64(0), [20_000], &device);
        let v: Vec<f32> = x.into_data().to_vec().unwrap();
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / v.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }
}
