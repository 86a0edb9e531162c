//! Compile-time backend selection
//!
//! - `ndarray`: CPU (default)
//! - `wgpu`: WebGPU (Vulkan/Metal/DX12)
//! - `cuda`: NVIDIA CUDA

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

/// Try to initialize CUDA and return true if successful
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    // CudaDevice::default() panics without a CUDA runtime
    std::panic::catch_unwind(|| {
        let _ = CudaDevice::default();
    })
    .is_ok()
}

/// Try to initialize WGPU and return true if successful
#[cfg(feature = "wgpu")]
pub fn wgpu_available() -> bool {
    // WgpuDevice::default() may panic if no adapter is found
    std::panic::catch_unwind(|| {
        let _ = WgpuDevice::default();
    })
    .is_ok()
}
