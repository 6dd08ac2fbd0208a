//! Device-resident tensor storage.

use super::CudaKernel;
use convlab_common::{KernelError, Real, Result};
use cudarc::driver::{CudaSlice, CudaStream};
use std::sync::Arc;

/// Full-size device copy of a tensor's host buffer.
pub struct DeviceBuffer {
    slice: CudaSlice<Real>,
    stream: Arc<CudaStream>,
}

impl DeviceBuffer {
    /// Allocate on `gpu` and upload `host`.
    pub fn from_host(gpu: &CudaKernel, host: &[Real]) -> Result<Self> {
        let stream = gpu.stream().clone();
        let slice = stream.memcpy_stod(host).map_err(|e| KernelError::GpuError {
            reason: format!("Failed to upload {} elements: {:?}", host.len(), e),
        })?;
        stream.synchronize().map_err(|e| KernelError::GpuError {
            reason: format!("Failed to synchronize after upload: {:?}", e),
        })?;
        Ok(Self { slice, stream })
    }

    pub fn upload(&mut self, host: &[Real]) -> Result<()> {
        self.check_len(host.len())?;
        self.stream.memcpy_htod(host, &mut self.slice).map_err(|e| KernelError::GpuError {
            reason: format!("Failed host-to-device copy: {:?}", e),
        })?;
        self.synchronize()
    }

    pub fn download(&self, host: &mut [Real]) -> Result<()> {
        self.check_len(host.len())?;
        self.stream.memcpy_dtoh(&self.slice, host).map_err(|e| KernelError::GpuError {
            reason: format!("Failed device-to-host copy: {:?}", e),
        })?;
        self.synchronize()
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.len() == 0
    }

    pub(crate) fn slice(&self) -> &CudaSlice<Real> {
        &self.slice
    }

    pub(crate) fn slice_mut(&mut self) -> &mut CudaSlice<Real> {
        &mut self.slice
    }

    fn check_len(&self, host_len: usize) -> Result<()> {
        if host_len != self.slice.len() {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "host buffer has {} elements, device mirror has {}",
                    host_len,
                    self.slice.len()
                ),
            }
            .into());
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().map_err(|e| {
            let reason = format!("Failed to synchronize stream: {:?}", e);
            KernelError::GpuError { reason }.into()
        })
    }
}
