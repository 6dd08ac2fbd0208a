//! Stub implementations for kernels not available in the current build
#![cfg_attr(feature = "cuda", allow(unused_imports))]

use crate::tensor::Tensor;
use crate::{AdaDeltaStep, ConvGrads, ConvKernel, ConvShape};
use convlab_common::{ConfigError, KernelError, Real, Result};

/// Stub implementation of Avx2Kernel for non-x86_64 architectures
#[cfg(not(target_arch = "x86_64"))]
pub struct Avx2Kernel;

#[cfg(not(target_arch = "x86_64"))]
impl ConvKernel for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn forward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _bias: &Tensor<1>,
        _y: &mut Tensor<4>,
    ) -> Result<()> {
        Err(unsupported("AVX2 kernel not available on non-x86_64 architectures"))
    }

    fn backward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _gy: &Tensor<4>,
        _grads: ConvGrads<'_>,
    ) -> Result<()> {
        Err(unsupported("AVX2 kernel not available on non-x86_64 architectures"))
    }

    fn update(&self, _step: AdaDeltaStep<'_>) -> Result<()> {
        Err(unsupported("AVX2 kernel not available on non-x86_64 architectures"))
    }
}

/// Stub implementation of NeonKernel for non-aarch64 architectures
#[cfg(not(target_arch = "aarch64"))]
pub struct NeonKernel;

#[cfg(not(target_arch = "aarch64"))]
impl ConvKernel for NeonKernel {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn forward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _bias: &Tensor<1>,
        _y: &mut Tensor<4>,
    ) -> Result<()> {
        Err(unsupported("NEON kernel not available on non-ARM64 architectures"))
    }

    fn backward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _gy: &Tensor<4>,
        _grads: ConvGrads<'_>,
    ) -> Result<()> {
        Err(unsupported("NEON kernel not available on non-ARM64 architectures"))
    }

    fn update(&self, _step: AdaDeltaStep<'_>) -> Result<()> {
        Err(unsupported("NEON kernel not available on non-ARM64 architectures"))
    }
}

#[allow(dead_code)]
fn unsupported(arch: &str) -> convlab_common::ConvLabError {
    KernelError::UnsupportedArchitecture { arch: arch.to_string() }.into()
}

/// Accelerator handle in a build without `cuda`. Uninhabited.
#[cfg(not(feature = "cuda"))]
pub enum CudaKernel {}

#[cfg(not(feature = "cuda"))]
impl CudaKernel {
    pub fn new_with_device(_device_index: usize) -> Result<Self> {
        Err(ConfigError::AcceleratorNotCompiled { operation: "device initialization".into() }
            .into())
    }

    pub fn device_index(&self) -> usize {
        match *self {}
    }

    pub fn synchronize(&self) -> Result<()> {
        match *self {}
    }
}

#[cfg(not(feature = "cuda"))]
impl ConvKernel for CudaKernel {
    fn name(&self) -> &'static str {
        match *self {}
    }

    fn is_available(&self) -> bool {
        match *self {}
    }

    fn forward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _bias: &Tensor<1>,
        _y: &mut Tensor<4>,
    ) -> Result<()> {
        match *self {}
    }

    fn backward(
        &self,
        _shape: &ConvShape,
        _x: &Tensor<4>,
        _weight: &Tensor<4>,
        _gy: &Tensor<4>,
        _grads: ConvGrads<'_>,
    ) -> Result<()> {
        match *self {}
    }

    fn update(&self, _step: AdaDeltaStep<'_>) -> Result<()> {
        match *self {}
    }
}

/// Device allocation in a build without `cuda`. Uninhabited.
#[cfg(not(feature = "cuda"))]
pub enum DeviceBuffer {}

#[cfg(not(feature = "cuda"))]
impl DeviceBuffer {
    pub fn from_host(gpu: &CudaKernel, _host: &[Real]) -> Result<Self> {
        match *gpu {}
    }

    pub fn upload(&mut self, _host: &[Real]) -> Result<()> {
        match *self {}
    }

    pub fn download(&self, _host: &mut [Real]) -> Result<()> {
        match *self {}
    }

    pub fn len(&self) -> usize {
        match *self {}
    }

    pub fn is_empty(&self) -> bool {
        match *self {}
    }
}
