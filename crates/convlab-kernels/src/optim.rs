//! Per-parameter AdaDelta state.
//!
//! Per element, with gradient `g`:
//!
//! ```text
//! avg_sq_grad  = rho * avg_sq_grad + (1 - rho) * g^2
//! delta        = -lr * g * sqrt(avg_sq_delta + eps) / sqrt(avg_sq_grad + eps)
//! param       += delta
//! avg_sq_delta = rho * avg_sq_delta + (1 - rho) * delta^2
//! ```

use crate::tensor::{Flat, FlatMut, Tensor};
use crate::ConvKernel;
use convlab_common::{KernelError, Real, Result};

/// Constants fixed when the optimizer is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaDeltaParams {
    pub lr: Real,
    pub rho: Real,
    pub eps: Real,
}

impl AdaDeltaParams {
    pub const RHO: Real = 0.95;
    pub const EPS: Real = 1e-6;

    pub fn with_lr(lr: Real) -> Self {
        Self { lr, rho: Self::RHO, eps: Self::EPS }
    }
}

impl Default for AdaDeltaParams {
    fn default() -> Self {
        Self::with_lr(1.0)
    }
}

/// One element of the recurrence. Returns the applied delta.
#[inline]
pub fn adadelta_step(
    p: &AdaDeltaParams,
    param: &mut Real,
    grad: Real,
    sq_grad: &mut Real,
    sq_delta: &mut Real,
) -> Real {
    *sq_grad = p.rho * *sq_grad + (1.0 - p.rho) * grad * grad;
    let delta = -p.lr * grad * (*sq_delta + p.eps).sqrt() / (*sq_grad + p.eps).sqrt();
    *param += delta;
    *sq_delta = p.rho * *sq_delta + (1.0 - p.rho) * delta * delta;
    delta
}

/// Operands of one optimizer step, erased to flat element ranges.
pub struct AdaDeltaStep<'a> {
    pub params: AdaDeltaParams,
    pub param: FlatMut<'a>,
    pub grad: Flat<'a>,
    pub sq_grad: FlatMut<'a>,
    pub sq_delta: FlatMut<'a>,
}

impl AdaDeltaStep<'_> {
    pub fn len(&self) -> usize {
        self.param.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn check_lengths(&self) -> Result<()> {
        let n = self.len();
        if self.grad.host.len() != n
            || self.sq_grad.host.len() != n
            || self.sq_delta.host.len() != n
        {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "optimizer operands disagree: param {}, grad {}, state {}/{}",
                    n,
                    self.grad.host.len(),
                    self.sq_grad.host.len(),
                    self.sq_delta.host.len()
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Run the recurrence over the host buffers.
    pub fn apply_on_host(self) -> Result<()> {
        self.check_lengths()?;
        let p = self.params;
        for (((w, &g), sg), sd) in self
            .param
            .host
            .iter_mut()
            .zip(self.grad.host)
            .zip(self.sq_grad.host.iter_mut())
            .zip(self.sq_delta.host.iter_mut())
        {
            adadelta_step(&p, w, g, sg, sd);
        }
        Ok(())
    }
}

/// Optimizer state for one parameter tensor.
#[derive(Debug, Clone)]
pub struct AdaDelta<const R: usize> {
    params: AdaDeltaParams,
    avg_sq_grad: Tensor<R>,
    avg_sq_delta: Tensor<R>,
}

impl<const R: usize> AdaDelta<R> {
    pub fn new(dims: [usize; R], lr: Real) -> Self {
        Self {
            params: AdaDeltaParams::with_lr(lr),
            avg_sq_grad: Tensor::zeros(dims),
            avg_sq_delta: Tensor::zeros(dims),
        }
    }

    pub fn params(&self) -> &AdaDeltaParams {
        &self.params
    }

    pub fn avg_sq_grad(&self) -> &Tensor<R> {
        &self.avg_sq_grad
    }

    pub fn avg_sq_delta(&self) -> &Tensor<R> {
        &self.avg_sq_delta
    }

    /// Zero both accumulators, on the device too when mirrored.
    pub fn reset(&mut self) -> Result<()> {
        for t in [&mut self.avg_sq_grad, &mut self.avg_sq_delta] {
            t.as_mut_slice().fill(0.0);
            if t.is_mirrored() {
                t.sync_to_device()?;
            }
        }
        Ok(())
    }

    /// Delta the next `update` would apply at flat element `index`.
    pub fn predicted_delta(&self, grad: Real, index: usize) -> Real {
        let p = &self.params;
        let sq_grad = p.rho * self.avg_sq_grad.as_slice()[index] + (1.0 - p.rho) * grad * grad;
        let sq_delta = self.avg_sq_delta.as_slice()[index];
        -p.lr * grad * (sq_delta + p.eps).sqrt() / (sq_grad + p.eps).sqrt()
    }

    /// Apply one step through `kernel`.
    pub fn update_with(
        &mut self,
        kernel: &dyn ConvKernel,
        param: &mut Tensor<R>,
        grad: &Tensor<R>,
    ) -> Result<()> {
        kernel.update(AdaDeltaStep {
            params: self.params,
            param: param.flat_mut(),
            grad: grad.flat(),
            sq_grad: self.avg_sq_grad.flat_mut(),
            sq_delta: self.avg_sq_delta.flat_mut(),
        })
    }

    /// Apply one step on the host.
    pub fn update(&mut self, param: &mut Tensor<R>, grad: &Tensor<R>) -> Result<()> {
        AdaDeltaStep {
            params: self.params,
            param: param.flat_mut(),
            grad: grad.flat(),
            sq_grad: self.avg_sq_grad.flat_mut(),
            sq_delta: self.avg_sq_delta.flat_mut(),
        }
        .apply_on_host()
    }

    pub(crate) fn to_device(&mut self, gpu: &crate::CudaKernel) -> Result<()> {
        self.avg_sq_grad.to_device(gpu)?;
        self.avg_sq_delta.to_device(gpu)
    }

    pub(crate) fn sync_to_host(&mut self) -> Result<()> {
        self.avg_sq_grad.sync_to_host()?;
        self.avg_sq_delta.sync_to_host()
    }

    pub(crate) fn sync_to_device(&mut self) -> Result<()> {
        self.avg_sq_grad.sync_to_device()?;
        self.avg_sq_delta.sync_to_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_from_zero_state() {
        let p = AdaDeltaParams::default();
        let (mut w, mut sg, mut sd) = (1.0, 0.0, 0.0);
        let g = 0.5;
        let delta = adadelta_step(&p, &mut w, g, &mut sg, &mut sd);

        let expected_sg: Real = 0.05 * 0.25;
        let expected_delta = -g * (1e-6 as Real).sqrt() / (expected_sg + 1e-6).sqrt();
        assert!((sg - expected_sg).abs() < 1e-7);
        assert!((delta - expected_delta).abs() < 1e-7);
        assert!(delta < 0.0);
        assert!((w - (1.0 + expected_delta)).abs() < 1e-6);
        assert!((sd - 0.05 * expected_delta * expected_delta).abs() < 1e-10);
    }

    #[test]
    fn zero_gradient_is_a_no_op_on_the_parameter() {
        let p = AdaDeltaParams::default();
        let (mut w, mut sg, mut sd) = (3.0, 0.2, 0.1);
        assert_eq!(adadelta_step(&p, &mut w, 0.0, &mut sg, &mut sd), 0.0);
        assert_eq!(w, 3.0);
    }

    #[test]
    fn predicted_delta_matches_update() {
        let mut opt = AdaDelta::<1>::new([3], 0.7);
        let mut param = Tensor::from_vec([3], vec![0.1, -0.2, 0.3]).unwrap();
        let grad = Tensor::from_vec([3], vec![1.0, -2.0, 0.0]).unwrap();

        for _ in 0..3 {
            let before = param.clone();
            let predicted: Vec<Real> = (0..3).map(|i| opt.predicted_delta(grad[[i]], i)).collect();
            opt.update(&mut param, &grad).unwrap();
            for i in 0..3 {
                assert!((param[[i]] - before[[i]] - predicted[i]).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut opt = AdaDelta::<1>::new([2], 1.0);
        let mut param = Tensor::from_vec([2], vec![0.0, 0.0]).unwrap();
        let grad = Tensor::from_vec([2], vec![1.0, 1.0]).unwrap();
        opt.update(&mut param, &grad).unwrap();
        assert!(opt.avg_sq_grad().as_slice().iter().all(|&v| v > 0.0));
        opt.reset().unwrap();
        assert!(opt.avg_sq_grad().as_slice().iter().all(|&v| v == 0.0));
        assert!(opt.avg_sq_delta().as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let mut opt = AdaDelta::<1>::new([2], 1.0);
        let mut param = Tensor::<1>::zeros([2]);
        let grad = Tensor::<1>::zeros([3]);
        assert!(opt.update(&mut param, &grad).is_err());
    }
}
