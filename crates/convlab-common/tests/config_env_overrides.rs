//! Environment and file loading tests for `RunConfig`.

use convlab_common::{Algo, ConfigError, RunConfig};
use serial_test::serial;
use std::io::Write;

const KEYS: [&str; 7] = [
    "CONVLAB_ALGO",
    "CONVLAB_PREFER_ACCELERATOR",
    "CONVLAB_LR",
    "CONVLAB_BATCH_SIZE",
    "CONVLAB_ITERATIONS",
    "CONVLAB_WEIGHT_SEED",
    "CONVLAB_DEVICE_INDEX",
];

fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
    let vars: Vec<(&str, Option<&str>)> = KEYS
        .iter()
        .map(|k| (*k, set.iter().find(|(key, _)| key == k).map(|(_, v)| *v)))
        .collect();
    temp_env::with_vars(vars, f);
}

#[test]
#[serial(convlab_env)]
fn empty_environment_gives_defaults() {
    with_env(&[], || {
        assert_eq!(RunConfig::from_env().unwrap(), RunConfig::default());
    });
}

#[test]
#[serial(convlab_env)]
fn env_overrides_every_field() {
    with_env(
        &[
            ("CONVLAB_ALGO", "cpu_simd"),
            ("CONVLAB_PREFER_ACCELERATOR", "yes"),
            ("CONVLAB_LR", "0.5"),
            ("CONVLAB_BATCH_SIZE", "16"),
            ("CONVLAB_ITERATIONS", "4"),
            ("CONVLAB_WEIGHT_SEED", "99"),
            ("CONVLAB_DEVICE_INDEX", "1"),
        ],
        || {
            let cfg = RunConfig::from_env().unwrap();
            assert_eq!(cfg.algo, Algo::CpuSimd);
            assert!(cfg.prefer_accelerator);
            assert_eq!(cfg.learning_rate, 0.5);
            assert_eq!(cfg.batch_size, 16);
            assert_eq!(cfg.iterations, 4);
            assert_eq!(cfg.weight_seed, 99);
            assert_eq!(cfg.device_index, 1);
        },
    );
}

#[test]
#[serial(convlab_env)]
fn invalid_algo_override_names_the_key() {
    with_env(&[("CONVLAB_ALGO", "cpu_test")], || match RunConfig::from_env().unwrap_err() {
        ConfigError::EnvOverride { key, value, .. } => {
            assert_eq!(key, "CONVLAB_ALGO");
            assert_eq!(value, "cpu_test");
        }
        other => panic!("expected EnvOverride, got: {other}"),
    });
}

#[test]
#[serial(convlab_env)]
fn invalid_batch_override_names_the_key() {
    with_env(&[("CONVLAB_BATCH_SIZE", "many")], || match RunConfig::from_env().unwrap_err() {
        ConfigError::EnvOverride { key, .. } => assert_eq!(key, "CONVLAB_BATCH_SIZE"),
        other => panic!("expected EnvOverride, got: {other}"),
    });
}

#[test]
#[serial(convlab_env)]
fn env_override_is_validated() {
    with_env(&[("CONVLAB_LR", "-2")], || {
        assert!(matches!(RunConfig::from_env().unwrap_err(), ConfigError::Validation(_)));
    });
}

#[test]
#[serial(convlab_env)]
fn file_then_env() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "algo = \"cpu_base\"\niterations = 3\nweight_seed = 5").unwrap();

    with_env(&[("CONVLAB_ITERATIONS", "7")], || {
        let cfg = RunConfig::load(file.path()).unwrap();
        assert_eq!(cfg.algo, Algo::CpuBase);
        assert_eq!(cfg.iterations, 7);
        assert_eq!(cfg.weight_seed, 5);
    });
}

#[test]
#[serial(convlab_env)]
fn missing_file_is_io_error() {
    with_env(&[], || {
        let err = RunConfig::load(std::path::Path::new("/nonexistent/convlab.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    });
}

#[test]
#[serial(convlab_env)]
fn accelerator_switch_is_case_insensitive() {
    for (raw, want) in [("TRUE", true), ("On", true), ("1", true), ("No", false), ("off", false)] {
        with_env(&[("CONVLAB_PREFER_ACCELERATOR", raw)], || {
            let cfg = RunConfig::from_env().unwrap();
            assert_eq!(cfg.prefer_accelerator, want, "{raw}");
        });
    }
}

#[test]
#[serial(convlab_env)]
fn misspelled_accelerator_switch_is_rejected() {
    with_env(&[("CONVLAB_PREFER_ACCELERATOR", "treu")], || {
        match RunConfig::from_env() {
            Err(ConfigError::EnvOverride { key, value, .. }) => {
                assert_eq!(key, "CONVLAB_PREFER_ACCELERATOR");
                assert_eq!(value, "treu");
            }
            other => panic!("expected an override error, got {other:?}"),
        }
    });
}
