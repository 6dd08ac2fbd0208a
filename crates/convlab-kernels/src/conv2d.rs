//! Trainable 2-D convolution layer.
//!
//! [`Conv2d`] owns the weight `(OC, IC, K, K)`, the bias `(OC)`, their
//! gradients and AdaDelta states, and the per-call output and input-gradient
//! buffers. `forward` borrows the input batch and returns a [`ForwardPass`]
//! that keeps that borrow alive until `backward` has run, so the backward
//! pass always sees the exact input the forward pass consumed.
//!
//! Every call asks [`select_backend`] which body to run; the bodies are the
//! [`ConvKernel`] implementations in [`crate::cpu`] and the CUDA kernel.
//!
//! When the layer is mirrored on an accelerator, operations keep the
//! layer-owned operands they read coherent on the side they run on. A copy
//! is only refreshed when the last write to it happened on the other side:
//! mixing host and accelerator backends across operations, or editing
//! parameters on the host through [`Conv2d::weight_mut`] and friends. A loop
//! whose forward, backward and update all run on the accelerator never
//! copies layer state, and a host-only layer tracks nothing at all.
//!
//! Caller tensors (the input and the output gradient) and the results handed
//! back are never synchronized implicitly; use [`Tensor::sync_to_device`],
//! [`ForwardPass::sync_output`] and [`Conv2d::sync_to_host`].

use crate::cpu::FallbackKernel;
use crate::device::{CudaKernel, open_accelerator};
use crate::optim::AdaDelta;
use crate::profiling::{LOG_TARGET, OpStats, OpTimer};
use crate::tensor::Tensor;
use crate::{ConvGrads, ConvKernel, ConvShape, detect_capabilities, select_simd_kernel};
use convlab_common::{
    Algo, AlgoSelection, ConfigError, KernelBackend, KernelCapabilities, KernelError,
    MAX_BATCH_SIZE, Operation, RandomGen, Real, Result, RunConfig, ShapeError, select_backend,
};
use std::sync::Arc;

/// Fixed extents of a convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub max_batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_size: usize,
    pub out_channels: usize,
}

impl Conv2dConfig {
    /// The first layer of the 28x28 digit network: one input channel, 3x3
    /// kernel, 32 output channels.
    pub fn digits(max_batch: usize) -> Self {
        Self { max_batch, in_channels: 1, height: 28, width: 28, kernel_size: 3, out_channels: 32 }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let fields = [
            ("max_batch", self.max_batch),
            ("in_channels", self.in_channels),
            ("height", self.height),
            ("width", self.width),
            ("kernel_size", self.kernel_size),
            ("out_channels", self.out_channels),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        if self.max_batch > MAX_BATCH_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_batch must be <= {MAX_BATCH_SIZE}, got {}",
                self.max_batch
            )));
        }
        if self.kernel_size > self.height || self.kernel_size > self.width {
            return Err(ConfigError::Validation(format!(
                "kernel_size {} does not fit a {}x{} input",
                self.kernel_size, self.height, self.width
            )));
        }
        Ok(())
    }

    pub fn out_height(&self) -> usize {
        self.height + 1 - self.kernel_size
    }

    pub fn out_width(&self) -> usize {
        self.width + 1 - self.kernel_size
    }

    pub fn input_dims(&self) -> [usize; 4] {
        [self.max_batch, self.in_channels, self.height, self.width]
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.max_batch, self.out_channels, self.out_height(), self.out_width()]
    }

    pub fn weight_dims(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel_size, self.kernel_size]
    }

    /// Extents of a call on `batch` samples.
    pub fn shape(&self, batch: usize) -> ConvShape {
        ConvShape {
            batch,
            in_channels: self.in_channels,
            height: self.height,
            width: self.width,
            kernel_size: self.kernel_size,
            out_channels: self.out_channels,
        }
    }

    /// Half-width of the uniform initialization interval, `1/sqrt(IC·K·K)`.
    pub fn init_bound(&self) -> Real {
        1.0 / ((self.in_channels * self.kernel_size * self.kernel_size) as Real).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    Device,
}

impl Side {
    fn of(backend: KernelBackend) -> Self {
        match backend {
            KernelBackend::Accelerator => Side::Device,
            KernelBackend::Scalar | KernelBackend::Vectorized => Side::Host,
        }
    }

    fn other(self) -> Self {
        match self {
            Side::Host => Side::Device,
            Side::Device => Side::Host,
        }
    }
}

/// Groups of layer-owned tensors that move between host and device together.
#[derive(Debug, Clone, Copy)]
enum Part {
    Params,
    Grads,
    OptState,
    Output,
    InputGrad,
}

const PARTS: [Part; 5] = [Part::Params, Part::Grads, Part::OptState, Part::Output, Part::InputGrad];

/// Kernel resolved for one call.
enum KernelRef {
    Host(&'static dyn ConvKernel),
    Device(Arc<CudaKernel>),
}

impl KernelRef {
    fn get(&self) -> &dyn ConvKernel {
        match self {
            KernelRef::Host(k) => *k,
            KernelRef::Device(k) => k.as_ref(),
        }
    }
}

/// 2-D convolution layer, unit stride, no padding.
pub struct Conv2d {
    config: Conv2dConfig,
    algo: Algo,
    prefer_accelerator: bool,
    caps: KernelCapabilities,

    weight: Tensor<4>,
    bias: Tensor<1>,
    output: Tensor<4>,
    weight_grad: Tensor<4>,
    bias_grad: Tensor<1>,
    input_grad: Tensor<4>,
    opt_weight: AdaDelta<4>,
    opt_bias: AdaDelta<1>,

    accelerator: Option<Arc<CudaKernel>>,
    /// Per part, the side whose copy is out of date.
    stale: [Option<Side>; 5],
    stats: OpStats,
}

impl Conv2d {
    /// Build and initialize a layer.
    ///
    /// Resolves the backend of every operation up front: asking for the
    /// accelerator in a build without it fails here rather than on the first
    /// call. When any operation lands on the accelerator the layer is
    /// mirrored on `options.device_index`.
    pub fn new(config: Conv2dConfig, options: &RunConfig, rng: &mut RandomGen) -> Result<Self> {
        config.validate()?;
        options.validate()?;

        let mut layer = Self {
            config,
            algo: options.algo,
            prefer_accelerator: options.prefer_accelerator,
            caps: detect_capabilities(),
            weight: Tensor::zeros(config.weight_dims()),
            bias: Tensor::zeros([config.out_channels]),
            output: Tensor::zeros(config.output_dims()),
            weight_grad: Tensor::zeros(config.weight_dims()),
            bias_grad: Tensor::zeros([config.out_channels]),
            input_grad: Tensor::zeros(config.input_dims()),
            opt_weight: AdaDelta::new(config.weight_dims(), options.learning_rate),
            opt_bias: AdaDelta::new([config.out_channels], options.learning_rate),
            accelerator: None,
            stale: [None; 5],
            stats: OpStats::default(),
        };

        let selections = layer.selections()?;
        for sel in &selections {
            if sel.downgraded {
                log::warn!(target: LOG_TARGET, "{}: {}", sel.summary(), sel.rationale);
            } else {
                log::debug!(target: LOG_TARGET, "{}: {}", sel.summary(), sel.rationale);
            }
        }

        layer.init(rng)?;
        if selections.iter().any(|s| s.selected == KernelBackend::Accelerator) {
            layer.to_device(options.device_index)?;
        }
        Ok(layer)
    }

    /// Draw weight and bias from `U[-bound, bound)` and zero both optimizer
    /// states.
    pub fn init(&mut self, rng: &mut RandomGen) -> Result<()> {
        let bound = self.config.init_bound();
        let oc = self.config.out_channels;
        self.weight.init_uniform(oc, rng, -bound, bound)?;
        self.bias.init_uniform(oc, rng, -bound, bound)?;
        self.opt_weight.reset()?;
        self.opt_bias.reset()?;
        self.mark_written(Part::Params, Side::Host);
        self.refresh(Part::Params, Side::Device)
    }

    /// Backend selection for every operation under the current options.
    pub fn selections(&self) -> std::result::Result<Vec<AlgoSelection>, ConfigError> {
        [Operation::Forward, Operation::Backward, Operation::Update]
            .into_iter()
            .map(|op| select_backend(op, self.algo, self.prefer_accelerator, &self.caps))
            .collect()
    }

    /// Change the requested algorithm. Takes effect on the next call.
    pub fn set_algo(&mut self, algo: Algo) -> Result<()> {
        let previous = std::mem::replace(&mut self.algo, algo);
        if let Err(e) = self.selections() {
            self.algo = previous;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn algo(&self) -> Algo {
        self.algo
    }

    pub fn capabilities(&self) -> &KernelCapabilities {
        &self.caps
    }

    fn kernel(&self, op: Operation) -> Result<(KernelBackend, KernelRef)> {
        let sel = select_backend(op, self.algo, self.prefer_accelerator, &self.caps)?;
        log::trace!(target: LOG_TARGET, "{}", sel.summary());
        let kernel = match sel.selected {
            KernelBackend::Scalar => KernelRef::Host(&FallbackKernel),
            KernelBackend::Vectorized => KernelRef::Host(select_simd_kernel(self.caps.simd)?),
            KernelBackend::Accelerator => match &self.accelerator {
                Some(gpu) => KernelRef::Device(Arc::clone(gpu)),
                None => return Err(KernelError::NotMirrored { what: "layer".into() }.into()),
            },
        };
        Ok((sel.selected, kernel))
    }

    /// Run the forward pass on `x`, shape `(B, IC, H, W)`.
    ///
    /// `training` does not change the arithmetic.
    pub fn forward<'l, 'x>(
        &'l mut self,
        x: &'x Tensor<4>,
        training: bool,
    ) -> Result<ForwardPass<'l, 'x>> {
        let batch = x.leading_extent();
        if batch > self.config.max_batch {
            return Err(
                ShapeError::BatchTooLarge { requested: batch, max: self.config.max_batch }.into()
            );
        }
        let shape = self.config.shape(batch);
        if x.shape() != shape.input_shape() {
            return Err(ShapeError::mismatch("input", &shape.input_shape(), &x.shape()).into());
        }

        let (backend, kernel) = self.kernel(Operation::Forward)?;
        let side = Side::of(backend);
        self.refresh(Part::Params, side)?;
        self.output.set_leading_extent(batch)?;

        log::trace!(target: LOG_TARGET, "forward batch={batch} training={training}");
        let timer = OpTimer::start(Operation::Forward, backend);
        kernel.get().forward(&shape, x, &self.weight, &self.bias, &mut self.output)?;
        timer.finish(&mut self.stats);
        self.mark_written(Part::Output, side);

        Ok(ForwardPass { layer: self, input: x })
    }

    fn backward_from(&mut self, x: &Tensor<4>, gy: &Tensor<4>) -> Result<&Tensor<4>> {
        let shape = self.config.shape(x.leading_extent());
        if gy.shape() != shape.output_shape() {
            return Err(
                ShapeError::mismatch("output gradient", &shape.output_shape(), &gy.shape()).into()
            );
        }

        let (backend, kernel) = self.kernel(Operation::Backward)?;
        let side = Side::of(backend);
        self.refresh(Part::Params, side)?;
        self.input_grad.set_leading_extent(shape.batch)?;

        let timer = OpTimer::start(Operation::Backward, backend);
        kernel.get().backward(
            &shape,
            x,
            &self.weight,
            gy,
            ConvGrads {
                weight: &mut self.weight_grad,
                bias: &mut self.bias_grad,
                input: &mut self.input_grad,
            },
        )?;
        timer.finish(&mut self.stats);
        self.mark_written(Part::Grads, side);
        self.mark_written(Part::InputGrad, side);

        Ok(&self.input_grad)
    }

    /// Apply one optimizer step to weight and bias from the last gradients.
    pub fn update(&mut self) -> Result<()> {
        let (backend, kernel) = self.kernel(Operation::Update)?;
        let side = Side::of(backend);
        for part in [Part::Params, Part::Grads, Part::OptState] {
            self.refresh(part, side)?;
        }

        let timer = OpTimer::start(Operation::Update, backend);
        self.opt_weight.update_with(kernel.get(), &mut self.weight, &self.weight_grad)?;
        self.opt_bias.update_with(kernel.get(), &mut self.bias, &self.bias_grad)?;
        timer.finish(&mut self.stats);
        self.mark_written(Part::Params, side);
        self.mark_written(Part::OptState, side);
        Ok(())
    }

    fn mark_written(&mut self, part: Part, side: Side) {
        if self.accelerator.is_some() {
            self.stale[part as usize] = Some(side.other());
        }
    }

    /// Bring `part` up to date on `side` if that copy is stale.
    fn refresh(&mut self, part: Part, side: Side) -> Result<()> {
        if self.accelerator.is_none() || self.stale[part as usize] != Some(side) {
            return Ok(());
        }
        match (part, side) {
            (Part::Params, Side::Host) => {
                self.weight.sync_to_host()?;
                self.bias.sync_to_host()?;
            }
            (Part::Params, Side::Device) => {
                self.weight.sync_to_device()?;
                self.bias.sync_to_device()?;
            }
            (Part::Grads, Side::Host) => {
                self.weight_grad.sync_to_host()?;
                self.bias_grad.sync_to_host()?;
            }
            (Part::Grads, Side::Device) => {
                self.weight_grad.sync_to_device()?;
                self.bias_grad.sync_to_device()?;
            }
            (Part::OptState, Side::Host) => {
                self.opt_weight.sync_to_host()?;
                self.opt_bias.sync_to_host()?;
            }
            (Part::OptState, Side::Device) => {
                self.opt_weight.sync_to_device()?;
                self.opt_bias.sync_to_device()?;
            }
            (Part::Output, Side::Host) => self.output.sync_to_host()?,
            (Part::Output, Side::Device) => self.output.sync_to_device()?,
            (Part::InputGrad, Side::Host) => self.input_grad.sync_to_host()?,
            (Part::InputGrad, Side::Device) => self.input_grad.sync_to_device()?,
        }
        self.stale[part as usize] = None;
        Ok(())
    }

    /// Open the accelerator at `device_index` and mirror every layer tensor.
    pub fn to_device(&mut self, device_index: usize) -> Result<()> {
        let gpu = open_accelerator(device_index)?;
        self.attach(gpu)
    }

    /// Mirror this layer on the accelerator `other` uses. No-op when
    /// `other` is host-only.
    pub fn mirror_like(&mut self, other: &Conv2d) -> Result<()> {
        match &other.accelerator {
            Some(gpu) => self.attach(Arc::clone(gpu)),
            None => Ok(()),
        }
    }

    fn attach(&mut self, gpu: Arc<CudaKernel>) -> Result<()> {
        self.weight.to_device(&gpu)?;
        self.bias.to_device(&gpu)?;
        self.output.to_device(&gpu)?;
        self.weight_grad.to_device(&gpu)?;
        self.bias_grad.to_device(&gpu)?;
        self.input_grad.to_device(&gpu)?;
        self.opt_weight.to_device(&gpu)?;
        self.opt_bias.to_device(&gpu)?;
        self.accelerator = Some(gpu);
        self.stale = [None; 5];
        Ok(())
    }

    /// The accelerator this layer is mirrored on, for mirroring caller
    /// tensors onto the same device.
    pub fn accelerator(&self) -> Option<&Arc<CudaKernel>> {
        self.accelerator.as_ref()
    }

    /// Bring every stale host copy up to date.
    pub fn sync_to_host(&mut self) -> Result<()> {
        for part in PARTS {
            self.refresh(part, Side::Host)?;
        }
        Ok(())
    }

    /// Bring every stale device copy up to date.
    pub fn sync_to_device(&mut self) -> Result<()> {
        for part in PARTS {
            self.refresh(part, Side::Device)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor<4> {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor<1> {
        &self.bias
    }

    /// Host weight for direct edits; the device copy is refreshed before the
    /// next operation that reads it there.
    pub fn weight_mut(&mut self) -> &mut Tensor<4> {
        self.mark_written(Part::Params, Side::Host);
        &mut self.weight
    }

    pub fn bias_mut(&mut self) -> &mut Tensor<1> {
        self.mark_written(Part::Params, Side::Host);
        &mut self.bias
    }

    pub fn output(&self) -> &Tensor<4> {
        &self.output
    }

    pub fn weight_grad(&self) -> &Tensor<4> {
        &self.weight_grad
    }

    pub fn bias_grad(&self) -> &Tensor<1> {
        &self.bias_grad
    }

    pub fn input_grad(&self) -> &Tensor<4> {
        &self.input_grad
    }

    pub fn weight_optimizer(&self) -> &AdaDelta<4> {
        &self.opt_weight
    }

    pub fn bias_optimizer(&self) -> &AdaDelta<1> {
        &self.opt_bias
    }

    pub fn stats(&self) -> &OpStats {
        &self.stats
    }

    /// Fill the weight and bias gradients from `U[lo, hi)`.
    pub fn randomize_gradients(&mut self, rng: &mut RandomGen, lo: Real, hi: Real) -> Result<()> {
        let oc = self.config.out_channels;
        self.weight_grad.init_uniform(oc, rng, lo, hi)?;
        self.bias_grad.init_uniform(oc, rng, lo, hi)?;
        self.mark_written(Part::Grads, Side::Host);
        Ok(())
    }

    /// Copy the weight and bias gradients of `other`.
    pub fn copy_gradients_from(&mut self, other: &Conv2d) -> Result<()> {
        self.weight_grad.copy_from(&other.weight_grad)?;
        self.bias_grad.copy_from(&other.bias_grad)?;
        self.mark_written(Part::Grads, Side::Host);
        Ok(())
    }

    /// `weight += alpha·gw`, `bias += alpha·gb`
    pub fn accumulate_into_weights(&mut self, alpha: Real) -> Result<()> {
        self.refresh(Part::Params, Side::Host)?;
        self.refresh(Part::Grads, Side::Host)?;
        self.weight.add_scaled(alpha, &self.weight_grad)?;
        self.bias.add_scaled(alpha, &self.bias_grad)?;
        self.mark_written(Part::Params, Side::Host);
        Ok(())
    }

    /// `gw·gw' + gb·gb'` over the host copies.
    pub fn gradient_dot(&self, other: &Conv2d) -> Result<f64> {
        Ok(self.weight_grad.dot(&other.weight_grad)? + self.bias_grad.dot(&other.bias_grad)?)
    }
}

/// Copies host data only; the clone is not mirrored.
impl Clone for Conv2d {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            algo: self.algo,
            prefer_accelerator: self.prefer_accelerator,
            caps: self.caps,
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            output: self.output.clone(),
            weight_grad: self.weight_grad.clone(),
            bias_grad: self.bias_grad.clone(),
            input_grad: self.input_grad.clone(),
            opt_weight: self.opt_weight.clone(),
            opt_bias: self.opt_bias.clone(),
            accelerator: None,
            stale: [None; 5],
            stats: OpStats::default(),
        }
    }
}

impl std::fmt::Debug for Conv2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv2d")
            .field("config", &self.config)
            .field("algo", &self.algo)
            .field("prefer_accelerator", &self.prefer_accelerator)
            .field("mirrored", &self.accelerator.is_some())
            .finish()
    }
}

/// A completed forward pass holding the input it consumed.
pub struct ForwardPass<'l, 'x> {
    layer: &'l mut Conv2d,
    input: &'x Tensor<4>,
}

impl std::fmt::Debug for ForwardPass<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardPass")
            .field("config", &self.layer.config)
            .field("batch", &self.batch())
            .finish_non_exhaustive()
    }
}

impl<'l, 'x> ForwardPass<'l, 'x> {
    pub fn output(&self) -> &Tensor<4> {
        &self.layer.output
    }

    pub fn input(&self) -> &'x Tensor<4> {
        self.input
    }

    pub fn batch(&self) -> usize {
        self.input.leading_extent()
    }

    /// Copy the output to the host after an accelerator forward.
    pub fn sync_output(&mut self) -> Result<&Tensor<4>> {
        self.layer.refresh(Part::Output, Side::Host)?;
        Ok(&self.layer.output)
    }

    /// Backward pass for the retained input. `gy` must have shape
    /// `(B, OC, H-K+1, W-K+1)` with the batch of this forward.
    ///
    /// Returns the input gradient. After an accelerator backward the host
    /// copy is refreshed by [`ForwardPass::sync_input_grad`] or
    /// [`Conv2d::sync_to_host`].
    pub fn backward(&mut self, gy: &Tensor<4>) -> Result<&Tensor<4>> {
        self.layer.backward_from(self.input, gy)
    }

    pub fn sync_input_grad(&mut self) -> Result<&Tensor<4>> {
        self.layer.refresh(Part::InputGrad, Side::Host)?;
        Ok(&self.layer.input_grad)
    }

    /// Give the layer back for `update` and inspection.
    pub fn finish(self) -> &'l mut Conv2d {
        self.layer
    }
}
