//! Fallback CPU kernel implementation
//!
//! Plain nested loops over every index. This is the reference body the
//! vectorized and accelerator kernels are measured against, and the one the
//! default selection rule lands on.

use crate::tensor::Tensor;
use crate::{AdaDeltaStep, ConvGrads, ConvKernel, ConvShape, forward_element};
use convlab_common::{Real, Result};

/// Fallback CPU kernel that works on any architecture
///
/// Performance characteristics:
/// - Forward and each backward gradient: O(B·OC·IC·K²·OH·OW), no vectorization
/// - Input gradient is gathered per element with explicit range tests
pub struct FallbackKernel;

impl ConvKernel for FallbackKernel {
    fn name(&self) -> &'static str {
        "fallback"
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
        let (oh, ow) = (shape.out_height(), shape.out_width());

        for s in 0..shape.batch {
            for oc in 0..shape.out_channels {
                for i in 0..oh {
                    for j in 0..ow {
                        y[[s, oc, i, j]] = forward_element(x, weight, bias, shape, [s, oc, i, j]);
                    }
                }
            }
        }
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
        shape.check_backward(x, weight, gy, &grads)?;
        let ConvGrads { weight: gw, bias: gb, input: gx } = grads;
        let k = shape.kernel_size;
        let (oh, ow) = (shape.out_height(), shape.out_width());

        for oc in 0..shape.out_channels {
            for ic in 0..shape.in_channels {
                for di in 0..k {
                    for dj in 0..k {
                        // Products of two f32 are exact in f64, so the sum is
                        // independent of the order a vector backend uses.
                        let mut v = 0.0f64;
                        for s in 0..shape.batch {
                            for i in 0..oh {
                                for j in 0..ow {
                                    v += gy[[s, oc, i, j]] as f64
                                        * x[[s, ic, i + di, j + dj]] as f64;
                                }
                            }
                        }
                        gw[[oc, ic, di, dj]] = v as Real;
                    }
                }
            }
        }

        for oc in 0..shape.out_channels {
            let mut v = 0.0f64;
            for s in 0..shape.batch {
                for i in 0..oh {
                    for j in 0..ow {
                        v += gy[[s, oc, i, j]] as f64;
                    }
                }
            }
            gb[[oc]] = v as Real;
        }

        for s in 0..shape.batch {
            for ic in 0..shape.in_channels {
                for i in 0..shape.height {
                    for j in 0..shape.width {
                        gx[[s, ic, i, j]] = input_grad_element(gy, weight, shape, [s, ic, i, j]);
                    }
                }
            }
        }
        Ok(())
    }

    fn update(&self, step: AdaDeltaStep<'_>) -> Result<()> {
        step.apply_on_host()
    }
}

/// `gx[s,ic,i,j]`, summing only the taps whose output position `(i-di, j-dj)`
/// lies inside the output plane.
#[inline]
fn input_grad_element(
    gy: &Tensor<4>,
    weight: &Tensor<4>,
    shape: &ConvShape,
    [s, ic, i, j]: [usize; 4],
) -> Real {
    let k = shape.kernel_size;
    let (oh, ow) = (shape.out_height(), shape.out_width());
    let mut v: Real = 0.0;
    for oc in 0..shape.out_channels {
        for di in 0..k {
            if di > i || i - di >= oh {
                continue;
            }
            for dj in 0..k {
                if dj > j || j - dj >= ow {
                    continue;
                }
                v += gy[[s, oc, i - di, j - dj]] * weight[[oc, ic, di, dj]];
            }
        }
    }
    v
}
