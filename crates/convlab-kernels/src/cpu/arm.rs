//! ARM NEON convolution kernel
//!
//! Same loop structure as the AVX2 kernel with four `f32` lanes per
//! register. The weight and bias reductions widen to `f64` lanes and fold
//! with `vaddvq_f64`.
#![allow(unsafe_op_in_unsafe_fn)]

use crate::cpu::fallback::FallbackKernel;
use crate::tensor::Tensor;
use crate::{AdaDeltaStep, ConvGrads, ConvKernel, ConvShape};
use convlab_common::{KernelError, Real, Result};
use std::arch::aarch64::*;

const LANES: usize = 4;

/// NEON optimized convolution kernel for aarch64
pub struct NeonKernel;

impl ConvKernel for NeonKernel {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn is_available(&self) -> bool {
        std::arch::is_aarch64_feature_detected!("neon")
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
        // Safety: NEON was detected above
        unsafe { forward_neon(shape, x, weight, bias, y) };
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
        // Safety: NEON was detected above
        unsafe {
            weight_grad_neon(shape, x, gy, grads.weight);
            bias_grad_neon(shape, gy, grads.bias);
            input_grad_neon(shape, weight, gy, grads.input);
        }
        Ok(())
    }

    fn update(&self, step: AdaDeltaStep<'_>) -> Result<()> {
        FallbackKernel.update(step)
    }
}

impl NeonKernel {
    fn require(&self) -> Result<()> {
        if !self.is_available() {
            return Err(KernelError::UnsupportedHardware {
                required: "NEON".to_string(),
                available: "none".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[target_feature(enable = "neon")]
unsafe fn forward_neon(
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
            for i in 0..oh {
                for j in (0..vec_end).step_by(LANES) {
                    let mut acc = vdupq_n_f32(0.0);
                    for ic in 0..shape.in_channels {
                        for di in 0..k {
                            for dj in 0..k {
                                let wv = vdupq_n_f32(weight[[oc, ic, di, dj]]);
                                let xp = x.wide::<LANES>([s, ic, i + di, j + dj]).as_ptr();
                                acc = vfmaq_f32(acc, wv, vld1q_f32(xp));
                            }
                        }
                    }
                    acc = vaddq_f32(acc, vdupq_n_f32(b));
                    vst1q_f32(y.wide_mut::<LANES>([s, oc, i, j]).as_mut_ptr(), acc);
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

/// Splits four f32 lanes into two f64 vectors (low half first).
#[target_feature(enable = "neon")]
unsafe fn widen_neon(v: float32x4_t) -> (float64x2_t, float64x2_t) {
    (vcvt_f64_f32(vget_low_f32(v)), vcvt_high_f64_f32(v))
}

#[target_feature(enable = "neon")]
unsafe fn weight_grad_neon(shape: &ConvShape, x: &Tensor<4>, gy: &Tensor<4>, gw: &mut Tensor<4>) {
    let k = shape.kernel_size;
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    for oc in 0..shape.out_channels {
        for ic in 0..shape.in_channels {
            for di in 0..k {
                for dj in 0..k {
                    let mut acc_lo = vdupq_n_f64(0.0);
                    let mut acc_hi = vdupq_n_f64(0.0);
                    let mut tail = 0.0f64;
                    for s in 0..shape.batch {
                        for i in 0..oh {
                            for j in (0..vec_end).step_by(LANES) {
                                let gp = gy.wide::<LANES>([s, oc, i, j]).as_ptr();
                                let xp = x.wide::<LANES>([s, ic, i + di, j + dj]).as_ptr();
                                let (g_lo, g_hi) = widen_neon(vld1q_f32(gp));
                                let (x_lo, x_hi) = widen_neon(vld1q_f32(xp));
                                acc_lo = vfmaq_f64(acc_lo, g_lo, x_lo);
                                acc_hi = vfmaq_f64(acc_hi, g_hi, x_hi);
                            }
                            for j in vec_end..ow {
                                let g = gy[[s, oc, i, j]] as f64;
                                tail += g * x[[s, ic, i + di, j + dj]] as f64;
                            }
                        }
                    }
                    let sum = vaddvq_f64(vaddq_f64(acc_lo, acc_hi)) + tail;
                    gw[[oc, ic, di, dj]] = sum as Real;
                }
            }
        }
    }
}

#[target_feature(enable = "neon")]
unsafe fn bias_grad_neon(shape: &ConvShape, gy: &Tensor<4>, gb: &mut Tensor<1>) {
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let vec_end = ow - ow % LANES;

    for oc in 0..shape.out_channels {
        let mut acc = vdupq_n_f64(0.0);
        let mut tail = 0.0f64;
        for s in 0..shape.batch {
            for i in 0..oh {
                for j in (0..vec_end).step_by(LANES) {
                    let (lo, hi) = widen_neon(vld1q_f32(gy.wide::<LANES>([s, oc, i, j]).as_ptr()));
                    acc = vaddq_f64(acc, vaddq_f64(lo, hi));
                }
                for j in vec_end..ow {
                    tail += gy[[s, oc, i, j]] as f64;
                }
            }
        }
        gb[[oc]] = (vaddvq_f64(acc) + tail) as Real;
    }
}

#[target_feature(enable = "neon")]
unsafe fn input_grad_neon(
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
                        let wv = vdupq_n_f32(w);
                        for i in 0..oh {
                            for j in (0..vec_end).step_by(LANES) {
                                let gv = vld1q_f32(gy.wide::<LANES>([s, oc, i, j]).as_ptr());
                                let dst =
                                    gx.wide_mut::<LANES>([s, ic, i + di, j + dj]).as_mut_ptr();
                                vst1q_f32(dst, vfmaq_f32(vld1q_f32(dst), wv, gv));
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
