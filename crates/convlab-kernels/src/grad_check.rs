//! Finite-difference check of the layer's analytic gradients.
//!
//! For a random direction `d` in parameter space and `dx` in input space, a
//! central difference of the loss `L = gy·y` must agree with the directional
//! derivative assembled from the backward pass:
//!
//! ```text
//! gy·(y(w+d, x+dx) - y(w-d, x-dx))  ≈  2·(gw·d + gx·dx)
//! ```

use crate::conv2d::{Conv2d, Conv2dConfig};
use crate::profiling::{LOG_TARGET, OpStats};
use crate::tensor::Tensor;
use convlab_common::{RandomGen, Real, Result, RunConfig};
use std::fmt;

/// Tunables of one check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckOptions {
    /// Half-width of the perturbation interval.
    pub step: Real,
}

impl Default for GradCheckOptions {
    fn default() -> Self {
        Self { step: 1e-3 }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckReport {
    /// `2·(gw·d + gx·dx)`
    pub analytic: f64,
    /// `gy·(y₊ − y₋)`
    pub numeric: f64,
    pub relative_error: f64,
}

impl GradCheckReport {
    pub fn new(analytic: f64, numeric: f64) -> Self {
        let scale = analytic.abs().max(numeric.abs());
        let relative_error = if scale == 0.0 { 0.0 } else { (analytic - numeric).abs() / scale };
        Self { analytic, numeric, relative_error }
    }
}

impl fmt::Display for GradCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "analytic = {:.9e} numeric = {:.9e} relative error = {:.9}",
            self.analytic, self.numeric, self.relative_error
        )
    }
}

/// Aggregate over several checks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GradCheckSummary {
    pub reports: Vec<GradCheckReport>,
    /// Layer operations run by all checks, perturbed copies included.
    pub stats: OpStats,
}

impl GradCheckSummary {
    pub fn max_relative_error(&self) -> f64 {
        self.reports.iter().map(|r| r.relative_error).fold(0.0, f64::max)
    }

    pub fn avg_relative_error(&self) -> f64 {
        if self.reports.is_empty() {
            return 0.0;
        }
        self.reports.iter().map(|r| r.relative_error).sum::<f64>() / self.reports.len() as f64
    }
}

fn mirror_input<const R: usize>(layer: &Conv2d, t: &mut Tensor<R>) -> Result<()> {
    if let Some(gpu) = layer.accelerator() {
        t.to_device(gpu)?;
    }
    Ok(())
}

fn perturbed_output(layer: &mut Conv2d, x: &Tensor<4>) -> Result<Tensor<4>> {
    let mut pass = layer.forward(x, false)?;
    let y = pass.sync_output()?.clone();
    Ok(y)
}

/// Build a layer from `rng`, run one forward/backward on a random batch of
/// `batch` samples and compare against the central difference.
pub fn grad_check(
    config: Conv2dConfig,
    options: &RunConfig,
    rng: &mut RandomGen,
    batch: usize,
    check: &GradCheckOptions,
) -> Result<GradCheckReport> {
    check_once(config, options, rng, batch, check).map(|(report, _)| report)
}

fn check_once(
    config: Conv2dConfig,
    options: &RunConfig,
    rng: &mut RandomGen,
    batch: usize,
    check: &GradCheckOptions,
) -> Result<(GradCheckReport, OpStats)> {
    let h = check.step;
    let mut layer = Conv2d::new(config, options, rng)?;

    let mut x = Tensor::zeros(config.input_dims());
    x.init_uniform(batch, rng, 0.0, 1.0)?;
    let mut gy = Tensor::zeros(config.output_dims());
    gy.init_uniform(batch, rng, 0.0, 1.0)?;
    let mut dx = Tensor::zeros(config.input_dims());
    dx.init_uniform(batch, rng, -h, h)?;
    mirror_input(&layer, &mut x)?;
    mirror_input(&layer, &mut gy)?;

    {
        let mut pass = layer.forward(&x, true)?;
        pass.backward(&gy)?;
    }
    layer.sync_to_host()?;
    let gx = layer.input_grad().clone();

    let mut minus = layer.clone();
    let mut plus = layer.clone();
    minus.randomize_gradients(rng, -h, h)?;
    plus.copy_gradients_from(&minus)?;
    let param_term = layer.gradient_dot(&minus)?;
    minus.accumulate_into_weights(-1.0)?;
    plus.accumulate_into_weights(1.0)?;
    minus.mirror_like(&layer)?;
    plus.mirror_like(&layer)?;

    let mut x_minus = x.clone();
    x_minus.add_scaled(-1.0, &dx)?;
    let mut x_plus = x.clone();
    x_plus.add_scaled(1.0, &dx)?;
    mirror_input(&layer, &mut x_minus)?;
    mirror_input(&layer, &mut x_plus)?;

    let y_minus = perturbed_output(&mut minus, &x_minus)?;
    let mut diff = perturbed_output(&mut plus, &x_plus)?;
    diff.add_scaled(-1.0, &y_minus)?;

    let numeric = gy.dot(&diff)?;
    let analytic = 2.0 * (param_term + gx.dot(&dx)?);

    let mut stats = *layer.stats();
    stats.merge(minus.stats());
    stats.merge(plus.stats());
    Ok((GradCheckReport::new(analytic, numeric), stats))
}

/// Run `options.iterations` checks from a generator seeded with
/// `options.weight_seed`.
pub fn run_grad_checks(
    config: Conv2dConfig,
    options: &RunConfig,
    check: &GradCheckOptions,
) -> Result<GradCheckSummary> {
    let mut rng = RandomGen::new(options.weight_seed);
    let batch = options.effective_batch_size().min(config.max_batch);
    let mut summary = GradCheckSummary::default();
    for iter in 0..options.iterations {
        let (report, stats) = check_once(config, options, &mut rng, batch, check)?;
        log::info!("grad check {iter}: {report}");
        summary.reports.push(report);
        summary.stats.merge(&stats);
    }
    log::debug!(target: LOG_TARGET, "grad check timings\n{}", summary.stats);
    Ok(summary)
}
