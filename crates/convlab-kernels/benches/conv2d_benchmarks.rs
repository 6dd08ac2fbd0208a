//! Criterion benchmarks for the convolution kernels
//!
//! Compares the scalar body against the vectorized one on the digit-network
//! layer at a few batch sizes.

use convlab_common::{RandomGen, SimdLevel};
use convlab_kernels::{
    Conv2dConfig, ConvGrads, ConvKernel, ConvShape, Tensor, cpu::FallbackKernel, detect_simd,
    select_simd_kernel,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

/// Operands of one call, filled from a fixed seed.
struct BenchmarkData {
    shape: ConvShape,
    x: Tensor<4>,
    weight: Tensor<4>,
    bias: Tensor<1>,
    gy: Tensor<4>,
}

impl BenchmarkData {
    fn new(batch: usize) -> Self {
        let shape = Conv2dConfig::digits(batch).shape(batch);
        let mut rng = RandomGen::new(42);
        let mut x = Tensor::zeros(shape.input_shape());
        let mut weight = Tensor::zeros(shape.weight_shape());
        let mut bias = Tensor::zeros([shape.out_channels]);
        let mut gy = Tensor::zeros(shape.output_shape());
        x.init_uniform(batch, &mut rng, 0.0, 1.0).unwrap();
        weight.init_uniform(shape.out_channels, &mut rng, -0.3, 0.3).unwrap();
        bias.init_uniform(shape.out_channels, &mut rng, -0.3, 0.3).unwrap();
        gy.init_uniform(batch, &mut rng, -1.0, 1.0).unwrap();
        Self { shape, x, weight, bias, gy }
    }

    fn macs(&self) -> u64 {
        let s = &self.shape;
        (s.batch * s.out_channels * s.out_height() * s.out_width() * s.in_channels
            * s.kernel_size
            * s.kernel_size) as u64
    }
}

fn kernels() -> Vec<&'static dyn ConvKernel> {
    let mut out: Vec<&'static dyn ConvKernel> = vec![&FallbackKernel];
    let level = detect_simd();
    if level != SimdLevel::None {
        if let Ok(k) = select_simd_kernel(level) {
            out.push(k);
        }
    }
    out
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_forward");

    for batch in [1, 16, 64] {
        let data = BenchmarkData::new(batch);
        let mut y = Tensor::zeros(data.shape.output_shape());
        group.throughput(Throughput::Elements(data.macs()));

        for kernel in kernels() {
            group.bench_with_input(BenchmarkId::new(kernel.name(), batch), &data, |b, d| {
                b.iter(|| {
                    kernel
                        .forward(
                            black_box(&d.shape),
                            black_box(&d.x),
                            black_box(&d.weight),
                            black_box(&d.bias),
                            &mut y,
                        )
                        .unwrap();
                });
            });
        }
    }

    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_backward");

    for batch in [1, 16, 64] {
        let data = BenchmarkData::new(batch);
        let mut gw = Tensor::zeros(data.shape.weight_shape());
        let mut gb = Tensor::zeros([data.shape.out_channels]);
        let mut gx = Tensor::zeros(data.shape.input_shape());
        group.throughput(Throughput::Elements(3 * data.macs()));

        for kernel in kernels() {
            group.bench_with_input(BenchmarkId::new(kernel.name(), batch), &data, |b, d| {
                b.iter(|| {
                    kernel
                        .backward(
                            black_box(&d.shape),
                            black_box(&d.x),
                            black_box(&d.weight),
                            black_box(&d.gy),
                            ConvGrads { weight: &mut gw, bias: &mut gb, input: &mut gx },
                        )
                        .unwrap();
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
