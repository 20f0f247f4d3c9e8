//! Backend selection for guided sampling
//!
//! The sampling loop runs on [`DefaultBackend`]; guidance gradients need the
//! autodiff wrapper, [`GuidanceBackend`]. Enable a backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (default)
//! - `tch`: PyTorch backend via libtorch (supports CUDA, MPS)
//! - `wgpu`: WebGPU backend
//! - `cuda`: Native CUDA backend (NVIDIA GPUs only)
//!
//! ```toml
//! [dependencies]
//! burn-cgd = { version = "0.1", features = ["wgpu"] }
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "tch")]
pub use burn_tch::{LibTorch, LibTorchDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

pub use burn::backend::Autodiff;

#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub type DefaultBackend = LibTorch;

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub type DefaultBackend = Wgpu;

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub type DefaultBackend = Cuda;

/// Autodiff wrapper of [`DefaultBackend`], used for the CLIP gradient
#[cfg(any(feature = "ndarray", feature = "tch", feature = "wgpu", feature = "cuda"))]
pub type GuidanceBackend = Autodiff<DefaultBackend>;

#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// First CUDA device if libtorch can see one, otherwise the CPU
#[cfg(feature = "tch")]
pub fn libtorch_device() -> LibTorchDevice {
    if burn_tch::is_cuda_available() {
        LibTorchDevice::Cuda(0)
    } else {
        LibTorchDevice::Cpu
    }
}

#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub fn default_device() -> LibTorchDevice {
    libtorch_device()
}

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}
