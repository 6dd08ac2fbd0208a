//! Accelerator handle and device buffers for the active build.
//!
//! With the `cuda` feature these are the cudarc-backed types; without it they
//! are uninhabited stand-ins, so host-only builds keep the same API and any
//! attempt to reach a device fails with a configuration error.

#[cfg(feature = "cuda")]
pub use crate::cuda::{CudaKernel, DeviceBuffer};

#[cfg(not(feature = "cuda"))]
pub use crate::stubs::{CudaKernel, DeviceBuffer};

/// Open the accelerator at `device_index`.
pub fn open_accelerator(device_index: usize) -> convlab_common::Result<std::sync::Arc<CudaKernel>> {
    CudaKernel::new_with_device(device_index).map(std::sync::Arc::new)
}
