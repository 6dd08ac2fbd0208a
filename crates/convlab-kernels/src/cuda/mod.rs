//! CUDA convolution kernels using cudarc 0.17
//!
//! Every launch uses one thread per output element in 256-thread blocks and
//! is followed by a stream synchronize, so each operation is complete when it
//! returns. Operands must already be mirrored; nothing here copies host data
//! implicitly.

mod device;

pub use device::DeviceBuffer;

use crate::tensor::Tensor;
use crate::{AdaDeltaStep, ConvGrads, ConvKernel, ConvShape};
use convlab_common::{ConvLabError, KernelError, Real, Result};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 256;

/// CUDA kernel provider bound to one device and its default stream
pub struct CudaKernel {
    device_index: usize,
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    _module: Arc<CudaModule>,
    forward_fn: CudaFunction,
    weight_grad_fn: CudaFunction,
    bias_grad_fn: CudaFunction,
    input_grad_fn: CudaFunction,
    update_fn: CudaFunction,
}

fn gpu_err(what: &str) -> impl Fn(cudarc::driver::DriverError) -> ConvLabError + '_ {
    move |e| KernelError::GpuError { reason: format!("{what}: {e:?}") }.into()
}

fn launch_config(n: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: ((n as u32).div_ceil(BLOCK_SIZE), 1, 1),
        block_dim: (BLOCK_SIZE, 1, 1),
        shared_mem_bytes: 0,
    }
}

fn mirrored<'a, const R: usize>(t: &'a Tensor<R>, what: &str) -> Result<&'a CudaSlice<Real>> {
    t.device_buffer()
        .map(DeviceBuffer::slice)
        .ok_or_else(|| KernelError::NotMirrored { what: what.to_string() }.into())
}

fn mirrored_mut<'a, const R: usize>(
    t: &'a mut Tensor<R>,
    what: &str,
) -> Result<&'a mut CudaSlice<Real>> {
    t.device_buffer_mut()
        .map(DeviceBuffer::slice_mut)
        .ok_or_else(|| KernelError::NotMirrored { what: what.to_string() }.into())
}

impl CudaKernel {
    /// Create a CUDA kernel provider on device 0
    pub fn new() -> Result<Self> {
        Self::new_with_device(0)
    }

    /// Create a CUDA kernel provider on a specific device
    pub fn new_with_device(device_index: usize) -> Result<Self> {
        log::info!("Initializing CUDA convolution kernels on device {}", device_index);

        let ctx = CudaContext::new(device_index).map_err(|e| KernelError::GpuError {
            reason: format!("Failed to create CUDA context for device {}: {:?}", device_index, e),
        })?;
        let stream = ctx.default_stream();

        let ptx = compile_ptx(include_str!("../kernels/conv2d.cu")).map_err(|e| {
            KernelError::GpuError { reason: format!("Failed to compile PTX: {:?}", e) }
        })?;
        let module = ctx.load_module(ptx).map_err(|e| KernelError::GpuError {
            reason: format!("Failed to load CUDA module: {:?}", e),
        })?;

        let load = |name: &str| {
            module.load_function(name).map_err(|e| KernelError::GpuError {
                reason: format!("Failed to load function {}: {:?}", name, e),
            })
        };
        let forward_fn = load("conv2d_forward")?;
        let weight_grad_fn = load("conv2d_backward_weight")?;
        let bias_grad_fn = load("conv2d_backward_bias")?;
        let input_grad_fn = load("conv2d_backward_input")?;
        let update_fn = load("adadelta_update")?;

        Ok(Self {
            device_index,
            _ctx: ctx,
            stream,
            _module: module,
            forward_fn,
            weight_grad_fn,
            bias_grad_fn,
            input_grad_fn,
            update_fn,
        })
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub(crate) fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// Block until all queued work on the stream is done.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().map_err(gpu_err("Failed to synchronize stream"))
    }

    fn dims_args(shape: &ConvShape) -> [i32; 6] {
        [
            shape.batch as i32,
            shape.in_channels as i32,
            shape.height as i32,
            shape.width as i32,
            shape.kernel_size as i32,
            shape.out_channels as i32,
        ]
    }
}

impl ConvKernel for CudaKernel {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn forward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        bias: &Tensor<1>,
        y: &mut Tensor<4>,
    ) -> Result<()> {
        shape.check_forward(x, weight, bias, y)?;
        let n = shape.output_shape().iter().product::<usize>();
        if n == 0 {
            return Ok(());
        }

        let x_dev = mirrored(x, "input")?;
        let w_dev = mirrored(weight, "weight")?;
        let b_dev = mirrored(bias, "bias")?;
        let y_dev = mirrored_mut(y, "output")?;
        let dims = Self::dims_args(shape);

        let mut builder = self.stream.launch_builder(&self.forward_fn);
        builder.arg(x_dev);
        builder.arg(w_dev);
        builder.arg(b_dev);
        builder.arg(y_dev);
        for d in &dims {
            builder.arg(d);
        }
        unsafe { builder.launch(launch_config(n)) }
            .map_err(gpu_err("Failed to launch conv2d_forward"))?;
        self.synchronize()
    }

    fn backward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        gy: &Tensor<4>,
        grads: ConvGrads<'_>,
    ) -> Result<()> {
        shape.check_backward(x, weight, gy, &grads)?;
        let ConvGrads { weight: gw, bias: gb, input: gx } = grads;
        let dims = Self::dims_args(shape);

        let x_dev = mirrored(x, "input")?;
        let w_dev = mirrored(weight, "weight")?;
        let gy_dev = mirrored(gy, "output gradient")?;

        let n = shape.weight_shape().iter().product::<usize>();
        {
            let gw_dev = mirrored_mut(gw, "weight gradient")?;
            let mut builder = self.stream.launch_builder(&self.weight_grad_fn);
            builder.arg(x_dev);
            builder.arg(gy_dev);
            builder.arg(gw_dev);
            for d in &dims {
                builder.arg(d);
            }
            unsafe { builder.launch(launch_config(n)) }
                .map_err(gpu_err("Failed to launch conv2d_backward_weight"))?;
        }

        {
            let gb_dev = mirrored_mut(gb, "bias gradient")?;
            let (batch, oh, ow, oc) = (
                shape.batch as i32,
                shape.out_height() as i32,
                shape.out_width() as i32,
                shape.out_channels as i32,
            );
            let mut builder = self.stream.launch_builder(&self.bias_grad_fn);
            builder.arg(gy_dev);
            builder.arg(gb_dev);
            builder.arg(&batch);
            builder.arg(&oh);
            builder.arg(&ow);
            builder.arg(&oc);
            unsafe { builder.launch(launch_config(shape.out_channels)) }
                .map_err(gpu_err("Failed to launch conv2d_backward_bias"))?;
        }

        let n = shape.input_shape().iter().product::<usize>();
        if n > 0 {
            let gx_dev = mirrored_mut(gx, "input gradient")?;
            let mut builder = self.stream.launch_builder(&self.input_grad_fn);
            builder.arg(w_dev);
            builder.arg(gy_dev);
            builder.arg(gx_dev);
            for d in &dims {
                builder.arg(d);
            }
            unsafe { builder.launch(launch_config(n)) }
                .map_err(gpu_err("Failed to launch conv2d_backward_input"))?;
        }

        self.synchronize()
    }

    fn update(&self, step: AdaDeltaStep<'_>) -> Result<()> {
        step.check_lengths()?;
        let n = step.len();
        if n == 0 {
            return Ok(());
        }
        let AdaDeltaStep { params, param, grad, sq_grad, sq_delta } = step;

        let not_mirrored = |what: &str| -> ConvLabError {
            KernelError::NotMirrored { what: what.to_string() }.into()
        };
        let param_dev = param.device.ok_or_else(|| not_mirrored("parameter"))?.slice_mut();
        let grad_dev = grad.device.ok_or_else(|| not_mirrored("gradient"))?.slice();
        let sq_grad_dev =
            sq_grad.device.ok_or_else(|| not_mirrored("optimizer state"))?.slice_mut();
        let sq_delta_dev =
            sq_delta.device.ok_or_else(|| not_mirrored("optimizer state"))?.slice_mut();

        let n_arg = n as i32;
        let mut builder = self.stream.launch_builder(&self.update_fn);
        builder.arg(param_dev);
        builder.arg(grad_dev);
        builder.arg(sq_grad_dev);
        builder.arg(sq_delta_dev);
        builder.arg(&n_arg);
        builder.arg(&params.lr);
        builder.arg(&params.rho);
        builder.arg(&params.eps);
        unsafe { builder.launch(launch_config(n)) }
            .map_err(gpu_err("Failed to launch adadelta_update"))?;
        self.synchronize()
    }
}
