//! Error types for convlab

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum ConvLabError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by kernel bodies and device plumbing.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Invalid kernel arguments: {reason}")]
    InvalidArguments { reason: String },
    #[error("Unsupported hardware: required {required}, available {available}")]
    UnsupportedHardware { required: String, available: String },
    #[error("Unsupported architecture: {arch}")]
    UnsupportedArchitecture { arch: String },
    #[error("GPU error: {reason}")]
    GpuError { reason: String },
    #[error("{what} has no device mirror; call to_device first")]
    NotMirrored { what: String },
    #[error("No available kernel provider")]
    NoProvider,
}

/// Checked preconditions on tensor extents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("batch size {requested} exceeds capacity {max}")]
    BatchTooLarge { requested: usize, max: usize },
    #[error("{what}: expected shape {expected:?}, got {actual:?}")]
    Mismatch { what: String, expected: Vec<usize>, actual: Vec<usize> },
    #[error("buffer length {actual} does not match extents {dims:?} (expected {expected})")]
    DataLength { dims: Vec<usize>, expected: usize, actual: usize },
}

impl ShapeError {
    pub fn mismatch(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::Mismatch { what: what.into(), expected: expected.to_vec(), actual: actual.to_vec() }
    }
}

/// Configuration and selection failures. Fatal for a run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
    #[error("{operation} requested the accelerator but convlab was built without `cuda`")]
    AcceleratorNotCompiled { operation: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ConvLabError>;

impl ConvLabError {
    /// Whether this error comes from configuration rather than execution.
    pub fn is_config(&self) -> bool {
        matches!(self, ConvLabError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_converts_into_top_level() {
        let err: ConvLabError = KernelError::GpuError { reason: "launch".into() }.into();
        assert!(matches!(err, ConvLabError::Kernel(KernelError::GpuError { .. })));
        assert!(err.to_string().contains("launch"));
    }

    #[test]
    fn mismatch_message_lists_both_shapes() {
        let err = ShapeError::mismatch("output gradient", &[2, 3, 4, 4], &[1, 3, 4, 4]);
        let msg = err.to_string();
        assert!(msg.contains("[2, 3, 4, 4]"), "got: {msg}");
        assert!(msg.contains("[1, 3, 4, 4]"), "got: {msg}");
    }

    #[test]
    fn config_errors_are_flagged() {
        let err: ConvLabError =
            ConfigError::AcceleratorNotCompiled { operation: "forward".into() }.into();
        assert!(err.is_config());
        assert!(err.to_string().contains("cuda"));
    }
}
