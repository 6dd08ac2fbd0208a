//! AdaDelta behavior observed through the layer.

use convlab_common::{Algo, RandomGen, Real, RunConfig};
use convlab_kernels::{AdaDelta, Conv2d, Conv2dConfig, Tensor};
use proptest::prelude::*;

fn trained_layer(algo: Algo, lr: Real, seed: u64) -> Conv2d {
    let config = Conv2dConfig {
        max_batch: 2,
        in_channels: 2,
        height: 6,
        width: 9,
        kernel_size: 3,
        out_channels: 3,
    };
    let run = RunConfig { algo, learning_rate: lr, ..RunConfig::default() };
    let mut rng = RandomGen::new(seed);
    let mut layer = Conv2d::new(config, &run, &mut rng).unwrap();

    let mut x = Tensor::zeros(config.input_dims());
    x.init_uniform(2, &mut rng, -1.0, 1.0).unwrap();
    let mut gy = Tensor::zeros(config.output_dims());
    gy.init_uniform(2, &mut rng, -1.0, 1.0).unwrap();
    let mut pass = layer.forward(&x, true).unwrap();
    pass.backward(&gy).unwrap();
    drop(pass);
    layer
}

#[test]
fn update_moves_against_the_gradient() {
    for algo in [Algo::CpuBase, Algo::CpuSimd] {
        let mut layer = trained_layer(algo, 1.0, 7);
        let before = layer.weight().clone();
        let predicted: Vec<Real> = layer
            .weight_grad()
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &g)| layer.weight_optimizer().predicted_delta(g, i))
            .collect();

        layer.update().unwrap();

        let grads = layer.weight_grad().as_slice();
        for (i, ((&w1, &w0), &g)) in
            layer.weight().as_slice().iter().zip(before.as_slice()).zip(grads).enumerate()
        {
            let moved = w1 - w0;
            let want = predicted[i];
            assert!((moved - want).abs() <= 1e-6, "{algo} [{i}]: {moved} vs {want}");
            if g != 0.0 {
                assert!(moved * g < 0.0, "{algo} [{i}]: step {moved} with gradient {g}");
            }
        }
    }
}

#[test]
fn learning_rate_scales_the_step() {
    let mut unit = trained_layer(Algo::CpuBase, 1.0, 3);
    let mut half = trained_layer(Algo::CpuBase, 0.5, 3);
    let w0 = unit.weight().clone();
    unit.update().unwrap();
    half.update().unwrap();
    let pairs = unit.weight().as_slice().iter().zip(half.weight().as_slice());
    for ((&a, &b), &w) in pairs.zip(w0.as_slice()) {
        let (da, db) = (a - w, b - w);
        assert!((db - 0.5 * da).abs() <= 1e-6, "{da} vs {db}");
    }
}

#[test]
fn state_accumulates_across_updates() {
    let mut layer = trained_layer(Algo::CpuBase, 1.0, 11);
    layer.update().unwrap();
    let first: Vec<Real> = layer.weight_optimizer().avg_sq_delta().as_slice().to_vec();
    layer.update().unwrap();
    let second = layer.weight_optimizer().avg_sq_delta().as_slice();
    for (a, b) in first.iter().zip(second) {
        assert!(b >= a);
    }
    assert_eq!(layer.stats().update.calls, 2);
}

proptest! {
    #[test]
    fn step_opposes_gradient_sign(
        grads in prop::collection::vec(-10.0f32..10.0, 1..32),
        lr in 0.01f32..2.0,
    ) {
        let n = grads.len();
        let mut opt = AdaDelta::<1>::new([n], lr);
        let mut param = Tensor::zeros([n]);
        let grad = Tensor::from_vec([n], grads.clone()).unwrap();
        opt.update(&mut param, &grad).unwrap();
        for (w, g) in param.as_slice().iter().zip(&grads) {
            prop_assert!(w * g <= 0.0);
            prop_assert!(w.abs() <= lr * 1e-3 / 0.05f32.sqrt() * 1.01);
        }
    }
}
