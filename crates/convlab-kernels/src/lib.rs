//! 2-D convolution kernels and a trainable convolution layer
//!
//! Three interchangeable bodies implement the same [`ConvKernel`] contract:
//! plain nested loops ([`cpu::FallbackKernel`]), explicit SIMD lanes
//! ([`cpu::Avx2Kernel`], [`cpu::NeonKernel`]) and CUDA kernels
//! ([`CudaKernel`], behind the `cuda` feature). [`Conv2d`] owns the
//! parameters and per-call buffers and routes each operation to one of them.

use convlab_common::{KernelCapabilities, KernelError, Real, Result, ShapeError, SimdLevel};

pub mod conv2d;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod grad_check;
pub mod optim;
pub mod profiling;
pub mod stubs;
pub mod tensor;

pub use conv2d::{Conv2d, Conv2dConfig, ForwardPass};
pub use device::{CudaKernel, DeviceBuffer};
pub use grad_check::{
    GradCheckOptions, GradCheckReport, GradCheckSummary, grad_check, run_grad_checks,
};
pub use optim::{AdaDelta, AdaDeltaParams, AdaDeltaStep, adadelta_step};
pub use tensor::{Flat, FlatMut, Tensor};

/// Extents of one convolution call: `B` is the active batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_size: usize,
    pub out_channels: usize,
}

impl ConvShape {
    pub fn out_height(&self) -> usize {
        self.height + 1 - self.kernel_size
    }

    pub fn out_width(&self) -> usize {
        self.width + 1 - self.kernel_size
    }

    pub fn input_shape(&self) -> [usize; 4] {
        [self.batch, self.in_channels, self.height, self.width]
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_height(), self.out_width()]
    }

    pub fn weight_shape(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel_size, self.kernel_size]
    }

    fn valid(&self) -> Result<()> {
        if self.kernel_size == 0
            || self.kernel_size > self.height
            || self.kernel_size > self.width
        {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "kernel size {} does not fit a {}x{} input",
                    self.kernel_size, self.height, self.width
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Checks every operand of a forward call against these extents.
    pub fn check_forward(
        &self,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        bias: &Tensor<1>,
        y: &Tensor<4>,
    ) -> Result<()> {
        self.valid()?;
        expect_shape("input", &self.input_shape(), &x.shape())?;
        expect_shape("weight", &self.weight_shape(), &weight.shape())?;
        expect_shape("bias", &[self.out_channels], &bias.shape())?;
        expect_shape("output", &self.output_shape(), &y.shape())
    }

    /// Checks every operand of a backward call against these extents.
    pub fn check_backward(
        &self,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        gy: &Tensor<4>,
        grads: &ConvGrads<'_>,
    ) -> Result<()> {
        self.valid()?;
        expect_shape("input", &self.input_shape(), &x.shape())?;
        expect_shape("weight", &self.weight_shape(), &weight.shape())?;
        expect_shape("output gradient", &self.output_shape(), &gy.shape())?;
        expect_shape("weight gradient", &self.weight_shape(), &grads.weight.shape())?;
        expect_shape("bias gradient", &[self.out_channels], &grads.bias.shape())?;
        expect_shape("input gradient", &self.input_shape(), &grads.input.shape())
    }
}

fn expect_shape(what: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(ShapeError::mismatch(what, expected, actual).into());
    }
    Ok(())
}

/// Gradient outputs of a backward call.
pub struct ConvGrads<'a> {
    pub weight: &'a mut Tensor<4>,
    pub bias: &'a mut Tensor<1>,
    pub input: &'a mut Tensor<4>,
}

/// One body implementing the layer's three operations.
pub trait ConvKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;

    /// `y[s,oc,i,j] = bias[oc] + Σ weight[oc,ic,di,dj]·x[s,ic,i+di,j+dj]`
    fn forward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        bias: &Tensor<1>,
        y: &mut Tensor<4>,
    ) -> Result<()>;

    /// Overwrites the weight, bias and input gradients given `gy`.
    fn backward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        gy: &Tensor<4>,
        grads: ConvGrads<'_>,
    ) -> Result<()>;

    /// Applies one AdaDelta step to a parameter.
    fn update(&self, step: AdaDeltaStep<'_>) -> Result<()>;
}

/// Detect the SIMD unit usable by the vectorized kernels.
pub fn detect_simd() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if cpu::Avx2Kernel.is_available() {
            return SimdLevel::Avx2;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        if cpu::NeonKernel.is_available() {
            return SimdLevel::Neon;
        }
    }
    SimdLevel::None
}

/// Capabilities of this build on this host.
pub fn detect_capabilities() -> KernelCapabilities {
    KernelCapabilities { simd: detect_simd(), accelerator_compiled: cfg!(feature = "cuda") }
}

/// The vectorized kernel for `level`, if that unit exists on this host.
pub fn select_simd_kernel(level: SimdLevel) -> Result<&'static dyn ConvKernel> {
    let kernel: &'static dyn ConvKernel = match level {
        SimdLevel::Avx2 => &cpu::Avx2Kernel,
        SimdLevel::Neon => &cpu::NeonKernel,
        SimdLevel::None => return Err(KernelError::NoProvider.into()),
    };
    if kernel.is_available() {
        Ok(kernel)
    } else {
        Err(KernelError::UnsupportedHardware {
            required: level.to_string(),
            available: detect_simd().to_string(),
        }
        .into())
    }
}

/// One forward output element computed by direct summation.
#[inline]
pub(crate) fn forward_element(
    x: &Tensor<4>,
    weight: &Tensor<4>,
    bias: &Tensor<1>,
    shape: &ConvShape,
    [s, oc, i, j]: [usize; 4],
) -> Real {
    let k = shape.kernel_size;
    let mut v: Real = 0.0;
    for ic in 0..shape.in_channels {
        for di in 0..k {
            for dj in 0..k {
                v += weight[[oc, ic, di, dj]] * x[[s, ic, i + di, j + dj]];
            }
        }
    }
    v + bias[[oc]]
}
