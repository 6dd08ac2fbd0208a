//! Run options for the convolution layer.
//!
//! Loads [`RunConfig`] from a TOML file with environment variable overrides
//! via `CONVLAB_*` prefixed variables. The layer reads these options once, at
//! construction.

use crate::algo_selection::Algo;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest batch any layer buffer is sized for.
pub const MAX_BATCH_SIZE: usize = 64;

/// Options shared by the layer and the verification driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Requested algorithm.
    /// Override: `CONVLAB_ALGO`
    pub algo: Algo,

    /// Default rule picks the accelerator instead of scalar loops.
    /// Override: `CONVLAB_PREFER_ACCELERATOR`
    pub prefer_accelerator: bool,

    /// Optimizer step scale.
    /// Override: `CONVLAB_LR`
    pub learning_rate: f32,

    /// Requested batch size, clamped to [`MAX_BATCH_SIZE`].
    /// Override: `CONVLAB_BATCH_SIZE`
    pub batch_size: usize,

    /// Number of gradient checks to run.
    /// Override: `CONVLAB_ITERATIONS`
    pub iterations: usize,

    /// Seed for weight initialization and verification data.
    /// Override: `CONVLAB_WEIGHT_SEED`
    pub weight_seed: u64,

    /// Zero-based accelerator device.
    /// Override: `CONVLAB_DEVICE_INDEX`
    pub device_index: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            algo: Algo::Auto,
            prefer_accelerator: false,
            learning_rate: 1.0,
            batch_size: MAX_BATCH_SIZE,
            iterations: 1,
            weight_seed: 12_345_678,
            device_index: 0,
        }
    }
}

impl RunConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::Validation(format!("cannot serialize defaults: {e}")))
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: RunConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Batch size actually used by a run.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.min(MAX_BATCH_SIZE)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `CONVLAB_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("CONVLAB_ALGO") {
            self.algo = val.parse::<Algo>().map_err(|reason| ConfigError::EnvOverride {
                key: "CONVLAB_ALGO".into(),
                value: val.clone(),
                reason,
            })?;
        }

        if let Ok(val) = std::env::var("CONVLAB_PREFER_ACCELERATOR") {
            self.prefer_accelerator = parse_flag(&val).ok_or_else(|| ConfigError::EnvOverride {
                key: "CONVLAB_PREFER_ACCELERATOR".into(),
                value: val.clone(),
                reason: "expected one of 1/0, true/false, yes/no, on/off".into(),
            })?;
        }

        if let Ok(val) = std::env::var("CONVLAB_LR") {
            self.learning_rate = val.parse::<f32>().map_err(|e| ConfigError::EnvOverride {
                key: "CONVLAB_LR".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        self.batch_size = parse_usize_override("CONVLAB_BATCH_SIZE", self.batch_size)?;
        self.iterations = parse_usize_override("CONVLAB_ITERATIONS", self.iterations)?;
        self.device_index = parse_usize_override("CONVLAB_DEVICE_INDEX", self.device_index)?;

        if let Ok(val) = std::env::var("CONVLAB_WEIGHT_SEED") {
            self.weight_seed = val.parse::<u64>().map_err(|e| ConfigError::EnvOverride {
                key: "CONVLAB_WEIGHT_SEED".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

fn parse_usize_override(key: &str, current: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(current),
    }
}

/// Case-insensitive boolean switch as accepted from the environment.
fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
