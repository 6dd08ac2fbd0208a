//! Finite-difference verification of the analytic gradients.

use convlab_common::{Algo, RandomGen, RunConfig};
use convlab_kernels::{Conv2dConfig, GradCheckOptions, grad_check, run_grad_checks};
use proptest::prelude::*;

const MAX_RELATIVE_ERROR: f64 = 1e-2;

fn options(algo: Algo, iterations: usize, batch_size: usize) -> RunConfig {
    RunConfig { algo, iterations, batch_size, ..RunConfig::default() }
}

#[test]
fn digits_layer_passes_on_every_cpu_backend() {
    let config = Conv2dConfig::digits(8);
    for algo in [Algo::CpuBase, Algo::CpuSimd, Algo::Auto] {
        let summary =
            run_grad_checks(config, &options(algo, 2, 8), &GradCheckOptions::default()).unwrap();
        assert_eq!(summary.reports.len(), 2);
        assert!(
            summary.max_relative_error() < MAX_RELATIVE_ERROR,
            "{algo}: max relative error {}",
            summary.max_relative_error()
        );
        assert!(summary.avg_relative_error() <= summary.max_relative_error());
    }
}

#[test]
fn report_terms_are_nonzero() {
    let config = Conv2dConfig::digits(2);
    let mut rng = RandomGen::new(99);
    let report = grad_check(
        config,
        &options(Algo::CpuBase, 1, 2),
        &mut rng,
        2,
        &GradCheckOptions::default(),
    )
    .unwrap();
    assert!(report.analytic != 0.0);
    assert!(report.numeric != 0.0);
    assert!(report.analytic.signum() == report.numeric.signum(), "{report}");
}

#[test]
fn same_seed_same_report() {
    let config = Conv2dConfig::digits(4);
    let run = options(Algo::CpuBase, 1, 4);
    let a = run_grad_checks(config, &run, &GradCheckOptions::default()).unwrap();
    let b = run_grad_checks(config, &run, &GradCheckOptions::default()).unwrap();
    assert_eq!(a.reports, b.reports);
}

#[test]
fn summary_counts_every_layer_operation() {
    // Each check: forward+backward on the layer, one forward per perturbed copy.
    let config = Conv2dConfig::digits(2);
    let summary =
        run_grad_checks(config, &options(Algo::CpuBase, 3, 2), &GradCheckOptions::default())
            .unwrap();
    assert_eq!(summary.stats.forward.calls, 9);
    assert_eq!(summary.stats.backward.calls, 3);
    assert_eq!(summary.stats.update.calls, 0);

    let table = summary.stats.to_string();
    assert!(table.lines().any(|l| l.starts_with("forward") && l.contains("calls=9")), "{table}");
}

#[test]
fn batch_is_capped_by_the_layer() {
    let config = Conv2dConfig::digits(3);
    let summary =
        run_grad_checks(config, &options(Algo::CpuBase, 1, 64), &GradCheckOptions::default());
    assert!(summary.is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn small_shapes_pass(
        batch in 1usize..4,
        in_channels in 1usize..4,
        out_channels in 1usize..5,
        kernel_size in 1usize..5,
        extra_h in 0usize..6,
        extra_w in 0usize..12,
        seed in any::<u64>(),
    ) {
        let config = Conv2dConfig {
            max_batch: batch,
            in_channels,
            height: kernel_size + extra_h,
            width: kernel_size + extra_w,
            kernel_size,
            out_channels,
        };
        let run = RunConfig { algo: Algo::CpuSimd, weight_seed: seed, ..RunConfig::default() };
        let mut rng = RandomGen::new(seed);
        let report =
            grad_check(config, &run, &mut rng, batch, &GradCheckOptions::default()).unwrap();
        // Small sums can cancel; allow for the f32 rounding of y₊ − y₋.
        let gap = (report.analytic - report.numeric).abs();
        let scale = report.analytic.abs().max(report.numeric.abs());
        prop_assert!(gap <= MAX_RELATIVE_ERROR * scale + 1e-5, "{}", report);
    }
}

#[cfg(feature = "cuda")]
#[test]
#[ignore = "requires a CUDA device"]
fn accelerator_passes() {
    let config = Conv2dConfig::digits(8);
    let summary =
        run_grad_checks(config, &options(Algo::CudaBase, 2, 8), &GradCheckOptions::default())
            .unwrap();
    assert!(summary.max_relative_error() < MAX_RELATIVE_ERROR);
}
