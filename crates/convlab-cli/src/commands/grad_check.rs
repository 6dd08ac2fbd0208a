//! `convlab grad-check`

use anyhow::{Context, Result};
use clap::Args;
use convlab_common::{Algo, RunConfig};
use convlab_kernels::{Conv2dConfig, GradCheckOptions, run_grad_checks};
use tracing::{debug, info};

/// Verify the layer's gradients against central differences.
#[derive(Args, Debug, Clone)]
pub struct GradCheckCommand {
    /// Samples per batch (capped at 64)
    #[arg(short = 'b', long = "batch-size", value_name = "N")]
    pub batch_size: Option<usize>,

    /// Number of independent checks
    #[arg(short = 'e', long = "iterations", value_name = "N")]
    pub iterations: Option<usize>,

    /// Algorithm: cpu_base, cpu_simd, cuda_base or auto
    #[arg(short = 'a', long = "algo", value_name = "ALGO")]
    pub algo: Option<Algo>,

    /// Let the default rule pick the accelerator
    #[arg(long)]
    pub prefer_accelerator: bool,

    /// Seed of the weight and data generator
    #[arg(long, value_name = "SEED")]
    pub weight_seed: Option<u64>,

    /// AdaDelta learning rate
    #[arg(long = "lr", value_name = "LR")]
    pub learning_rate: Option<f32>,

    /// Input channels
    #[arg(long = "ic", value_name = "N", default_value_t = 1)]
    pub in_channels: usize,

    /// Input height
    #[arg(long, value_name = "N", default_value_t = 28)]
    pub height: usize,

    /// Input width
    #[arg(long, value_name = "N", default_value_t = 28)]
    pub width: usize,

    /// Square kernel size
    #[arg(long = "kernel", value_name = "N", default_value_t = 3)]
    pub kernel_size: usize,

    /// Output channels
    #[arg(long = "oc", value_name = "N", default_value_t = 32)]
    pub out_channels: usize,

    /// Perturbation half-width
    #[arg(long, value_name = "H", default_value_t = 1e-3)]
    pub step: f32,
}

impl Default for GradCheckCommand {
    fn default() -> Self {
        let digits = Conv2dConfig::digits(1);
        Self {
            batch_size: None,
            iterations: None,
            algo: None,
            prefer_accelerator: false,
            weight_seed: None,
            learning_rate: None,
            in_channels: digits.in_channels,
            height: digits.height,
            width: digits.width,
            kernel_size: digits.kernel_size,
            out_channels: digits.out_channels,
            step: GradCheckOptions::default().step,
        }
    }
}

impl GradCheckCommand {
    /// Fold the command-line flags over the loaded options.
    pub fn run_config(&self, mut options: RunConfig) -> convlab_common::Result<RunConfig> {
        if let Some(n) = self.batch_size {
            options.batch_size = n;
        }
        if let Some(n) = self.iterations {
            options.iterations = n;
        }
        if let Some(algo) = self.algo {
            options.algo = algo;
        }
        options.prefer_accelerator |= self.prefer_accelerator;
        if let Some(seed) = self.weight_seed {
            options.weight_seed = seed;
        }
        if let Some(lr) = self.learning_rate {
            options.learning_rate = lr;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn layer_config(&self, options: &RunConfig) -> Conv2dConfig {
        Conv2dConfig {
            max_batch: options.effective_batch_size(),
            in_channels: self.in_channels,
            height: self.height,
            width: self.width,
            kernel_size: self.kernel_size,
            out_channels: self.out_channels,
        }
    }

    pub fn execute(&self, options: RunConfig) -> Result<()> {
        let options = self.run_config(options)?;
        let config = self.layer_config(&options);
        info!(
            algo = %options.algo,
            batch = config.max_batch,
            iterations = options.iterations,
            seed = options.weight_seed,
            "starting gradient check"
        );

        let check = GradCheckOptions { step: self.step };
        let summary = run_grad_checks(config, &options, &check).context("gradient check failed")?;

        for (i, report) in summary.reports.iter().enumerate() {
            println!("==== {i} ====");
            println!("{report}");
        }
        println!("max relative error = {:.9}", summary.max_relative_error());
        println!("avg relative error = {:.9}", summary.avg_relative_error());
        debug!("layer operation timings\n{}", summary.stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_loaded_options() {
        let cmd = GradCheckCommand {
            batch_size: Some(8),
            algo: Some(Algo::CpuSimd),
            learning_rate: Some(0.5),
            ..GradCheckCommand::default()
        };
        let options = cmd.run_config(RunConfig::default()).unwrap();
        assert_eq!(options.batch_size, 8);
        assert_eq!(options.algo, Algo::CpuSimd);
        assert_eq!(options.learning_rate, 0.5);
        assert_eq!(options.iterations, RunConfig::default().iterations);
    }

    #[test]
    fn invalid_flag_values_are_config_errors() {
        let cmd = GradCheckCommand { learning_rate: Some(-1.0), ..GradCheckCommand::default() };
        assert!(cmd.run_config(RunConfig::default()).unwrap_err().is_config());
    }

    #[test]
    fn layer_batch_is_capped() {
        let cmd = GradCheckCommand::default();
        let options = RunConfig { batch_size: 500, ..RunConfig::default() };
        assert_eq!(cmd.layer_config(&options).max_batch, 64);
    }
}
