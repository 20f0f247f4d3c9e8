//! Conversions between [-1, 1] image tensors and packed RGB bytes

use burn::prelude::*;

use crate::error::{CgdError, Result};

/// Convert one image of a `[batch, 3, H, W]` tensor in [-1, 1] to RGB bytes
pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>, index: usize) -> Result<Vec<u8>> {
    let [batch, channels, h, w] = tensor.dims();
    if index >= batch || channels != 3 {
        return Err(CgdError::Tensor(format!(
            "cannot take RGB image {index} from tensor of shape [{batch}, {channels}, {h}, {w}]"
        )));
    }

    let image = tensor.slice([index..index + 1, 0..3, 0..h, 0..w]);
    let image = ((image + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0;
    let floats: Vec<f32> = image.into_data().convert::<f32>().to_vec()?;

    let mut rgb = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let idx = c * h * w + y * w + x;
                rgb.push(floats[idx].round() as u8);
            }
        }
    }

    Ok(rgb)
}

/// Convert packed RGB bytes to a `[1, 3, H, W]` tensor in [-1, 1]
pub fn rgb_to_tensor<B: Backend>(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    if rgb.len() != width * height * 3 {
        return Err(CgdError::Tensor(format!(
            "expected {} RGB bytes for {width}x{height}, got {}",
            width * height * 3,
            rgb.len()
        )));
    }

    let mut planar = vec![0.0f32; rgb.len()];
    for (i, px) in rgb.chunks_exact(3).enumerate() {
        for c in 0..3 {
            planar[c * width * height + i] = px[c] as f32 / 255.0 * 2.0 - 1.0;
        }
    }

    Ok(Tensor::from_data(
        TensorData::new(planar, [1, 3, height, width]),
        device,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_rgb_tensor_layout() {
        let device = Default::default();
        // 2x1 image: red pixel, then blue pixel
        let rgb = [255u8, 0, 0, 0, 0, 255];
        let t = rgb_to_tensor::<TestBackend>(&rgb, 2, 1, &device).unwrap();
        assert_eq!(t.dims(), [1, 3, 1, 2]);
        let values: Vec<f32> = t.clone().into_data().to_vec().unwrap();
        // channel 0 (red): [1, -1]; channel 2 (blue): [-1, 1]
        assert_eq!(values, vec![1.0, -1.0, -1.0, -1.0, -1.0, 1.0]);
        assert_eq!(tensor_to_rgb(t, 0).unwrap(), rgb.to_vec());
    }

    #[test]
    fn test_tensor_to_rgb_clamps() {
        let device = Default::default();
        let t: Tensor<TestBackend, 4> = Tensor::ones([1, 3, 1, 1], &device) * 4.0;
        assert_eq!(tensor_to_rgb(t, 0).unwrap(), vec![255, 255, 255]);
    }

    #[test]
    fn test_rejects_bad_index_and_length() {
        let device = Default::default();
        let t: Tensor<TestBackend, 4> = Tensor::zeros([1, 3, 1, 1], &device);
        assert!(tensor_to_rgb(t, 1).is_err());
        assert!(rgb_to_tensor::<TestBackend>(&[0u8; 5], 1, 2, &device).is_err());
    }
}
