//! x86_64 CPU kernel with AVX2 + FMA
#![allow(unsafe_op_in_unsafe_fn)]

use crate::cpu::fallback::FallbackKernel;
use crate::tensor::Tensor;
use crate::{AdaDeltaStep, ConvGrads, ConvKernel, ConvShape};
use convlab_common::{KernelError, Real, Result};
use std::arch::x86_64::*;

const LANES: usize = 8;

/// AVX2 optimized convolution kernel for x86_64
///
/// Vectorizes over the innermost output axis, eight `f32` lanes at a time,
/// with a scalar tail for the remaining columns. The weight and bias
/// reductions widen each lane to `f64` and fold the partial sums with a
/// horizontal add at the end, which keeps them within rounding of the scalar
/// backend on long reductions. The input gradient is scattered: each output-gradient row
/// is added into the input-gradient row shifted by the tap offset, so no
/// lane ever needs a range test.
pub struct Avx2Kernel;

impl ConvKernel for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn is_available(&self) -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    fn forward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        bias: &Tensor<1>,
        y: &mut Tensor<4>,
    ) -> Result<()> {
        self.require()?;
        shape.check_forward(x, weight, bias, y)?;
        // Safety: AVX2 and FMA were detected above
        unsafe { forward_avx2(shape, x, weight, bias, y) };
        Ok(())
    }

    fn backward(
        &self,
        shape: &ConvShape,
        x: &Tensor<4>,
        weight: &Tensor<4>,
        gy: &Tensor<4>,
        grads: ConvGrads<'_>,
    ) -> Result<()> {
        self.require()?;
        shape.check_backward(x, weight, gy, &grads)?;
        // Safety: AVX2 and FMA were detected above
        unsafe {
            weight_grad_avx2(shape, x, gy, grads.weight);
            bias_grad_avx2(shape, gy, grads.bias);
            input_grad_avx2(shape, weight, gy, grads.input);
        }
        Ok(())
    }

    fn update(&self, step: AdaDeltaStep<'_>) -> Result<()> {
        FallbackKernel.update(step)
    }
}

impl Avx2Kernel {
    fn require(&self) -> Result<()> {
        if !self.is_available() {
            return Err(KernelError::UnsupportedHardware {
                required: "AVX2+FMA".to_string(),
                available: "none".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn hsum_pd_avx2(v: __m256d) -> f64 {
    let hi = _mm256_extractf128_pd::<1>(v);
    let lo = _mm256_castpd256_pd128(v);
    let sum2 = _mm_add_pd(hi, lo);
    let hi1 = _mm_unpackhi_pd(sum2, sum2);
    _mm_cvtsd_f64(_mm_add_sd(sum2, hi1))
}

/// Splits eight f32 lanes into two f64 vectors (low half first).
#[target_feature(enable = "avx2,fma")]
unsafe fn widen_avx2(v: __m256) -> (__m256d, __m256d) {
    let lo = _mm256_cvtps_pd(_mm256_castps256_ps128(v));
    let hi = _mm256_cvtps_pd(_mm256_extractf128_ps::<1>(v));
    (lo, hi)
}

#[target_feature(enable = "avx2,fma")]
unsafe fn forward_avx2(
    shape: &ConvShape,
    x: &Tensor<4>,
    weight: &Tensor<4>,
    bias: &Tensor<1>,
    y: &mut Tensor<4>,
) {
    let k = shape.kernel_size;
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    for s in 0..shape.batch {
        for oc in 0..shape.out_channels {
            let b = bias[[oc]];
            let bv = _mm256_set1_ps(b);
            for i in 0..oh {
                for j in (0..vec_end).step_by(LANES) {
                    let mut acc = _mm256_setzero_ps();
                    for ic in 0..shape.in_channels {
                        for di in 0..k {
                            for dj in 0..k {
                                let wv = _mm256_set1_ps(weight[[oc, ic, di, dj]]);
                                let xv = _mm256_loadu_ps(
                                    x.wide::<LANES>([s, ic, i + di, j + dj]).as_ptr(),
                                );
                                acc = _mm256_fmadd_ps(wv, xv, acc);
                            }
                        }
                    }
                    acc = _mm256_add_ps(acc, bv);
                    _mm256_storeu_ps(y.wide_mut::<LANES>([s, oc, i, j]).as_mut_ptr(), acc);
                }
                for j in vec_end..ow {
                    let mut v: Real = 0.0;
                    for ic in 0..shape.in_channels {
                        for di in 0..k {
                            for dj in 0..k {
                                v += weight[[oc, ic, di, dj]] * x[[s, ic, i + di, j + dj]];
                            }
                        }
                    }
                    y[[s, oc, i, j]] = v + b;
                }
            }
        }
    }
}

// Weight and bias gradients accumulate in f64 lanes so the result agrees with
// the scalar backend regardless of summation order.
#[target_feature(enable = "avx2,fma")]
unsafe fn weight_grad_avx2(shape: &ConvShape, x: &Tensor<4>, gy: &Tensor<4>, gw: &mut Tensor<4>) {
    let k = shape.kernel_size;
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    for oc in 0..shape.out_channels {
        for ic in 0..shape.in_channels {
            for di in 0..k {
                for dj in 0..k {
                    let mut acc_lo = _mm256_setzero_pd();
                    let mut acc_hi = _mm256_setzero_pd();
                    let mut tail = 0.0f64;
                    for s in 0..shape.batch {
                        for i in 0..oh {
                            for j in (0..vec_end).step_by(LANES) {
                                let gp = gy.wide::<LANES>([s, oc, i, j]).as_ptr();
                                let xp = x.wide::<LANES>([s, ic, i + di, j + dj]).as_ptr();
                                let (g_lo, g_hi) = widen_avx2(_mm256_loadu_ps(gp));
                                let (x_lo, x_hi) = widen_avx2(_mm256_loadu_ps(xp));
                                acc_lo = _mm256_fmadd_pd(g_lo, x_lo, acc_lo);
                                acc_hi = _mm256_fmadd_pd(g_hi, x_hi, acc_hi);
                            }
                            for j in vec_end..ow {
                                let g = gy[[s, oc, i, j]] as f64;
                                tail += g * x[[s, ic, i + di, j + dj]] as f64;
                            }
                        }
                    }
                    let sum = hsum_pd_avx2(_mm256_add_pd(acc_lo, acc_hi)) + tail;
                    gw[[oc, ic, di, dj]] = sum as Real;
                }
            }
        }
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn bias_grad_avx2(shape: &ConvShape, gy: &Tensor<4>, gb: &mut Tensor<1>) {
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    for oc in 0..shape.out_channels {
        let mut acc = _mm256_setzero_pd();
        let mut tail = 0.0f64;
        for s in 0..shape.batch {
            for i in 0..oh {
                for j in (0..vec_end).step_by(LANES) {
                    let gp = gy.wide::<LANES>([s, oc, i, j]).as_ptr();
                    let (lo, hi) = widen_avx2(_mm256_loadu_ps(gp));
                    acc = _mm256_add_pd(acc, _mm256_add_pd(lo, hi));
                }
                for j in vec_end..ow {
                    tail += gy[[s, oc, i, j]] as f64;
                }
            }
        }
        gb[[oc]] = (hsum_pd_avx2(acc) + tail) as Real;
    }
}

#[target_feature(enable = "avx2,fma")]
unsafe fn input_grad_avx2(
    shape: &ConvShape,
    weight: &Tensor<4>,
    gy: &Tensor<4>,
    gx: &mut Tensor<4>,
) {
    let k = shape.kernel_size;
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    gx.as_mut_slice().fill(0.0);
    for s in 0..shape.batch {
        for ic in 0..shape.in_channels {
            for oc in 0..shape.out_channels {
                for di in 0..k {
                    for dj in 0..k {
                        let w = weight[[oc, ic, di, dj]];
                        let wv = _mm256_set1_ps(w);
                        for i in 0..oh {
                            for j in (0..vec_end).step_by(LANES) {
                                let gp = gy.wide::<LANES>([s, oc, i, j]).as_ptr();
                                let gv = _mm256_loadu_ps(gp);
                                let dst =
                                    gx.wide_mut::<LANES>([s, ic, i + di, j + dj]).as_mut_ptr();
                                let acc = _mm256_fmadd_ps(wv, gv, _mm256_loadu_ps(dst));
                                _mm256_storeu_ps(dst, acc);
                            }
                            for j in vec_end..ow {
                                gx[[s, ic, i + di, j + dj]] += w * gy[[s, oc, i, j]];
                            }
                        }
                    }
                }
            }
        }
    }
}
