//! Per-operation algorithm selection.
//!
//! Answers "requested X, detected Y, selected Z" for each of the layer's
//! operations. This is the single place that encodes the fallback order; the
//! layer asks it on every call instead of keeping its own switch statements.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Algorithm requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algo {
    /// Plain nested loops.
    CpuBase,
    /// Explicit SIMD lanes over the innermost spatial axis.
    CpuSimd,
    /// Device-offloaded kernels.
    CudaBase,
    /// Use the default rule for every operation.
    #[default]
    Auto,
}

impl fmt::Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algo::CpuBase => write!(f, "cpu_base"),
            Algo::CpuSimd => write!(f, "cpu_simd"),
            Algo::CudaBase => write!(f, "cuda_base"),
            Algo::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for Algo {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "cpu_base" => Ok(Self::CpuBase),
            "cpu_simd" => Ok(Self::CpuSimd),
            "cuda_base" => Ok(Self::CudaBase),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown algorithm: {other} (expected cpu_base, cpu_simd, cuda_base or auto)"
            )),
        }
    }
}

/// Layer operation being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Forward,
    Backward,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Forward => write!(f, "forward"),
            Operation::Backward => write!(f, "backward"),
            Operation::Update => write!(f, "update"),
        }
    }
}

/// Concrete body that runs an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelBackend {
    Scalar,
    Vectorized,
    Accelerator,
}

impl fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelBackend::Scalar => write!(f, "scalar"),
            KernelBackend::Vectorized => write!(f, "vectorized"),
            KernelBackend::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// SIMD unit detected on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    None,
    Avx2,
    Neon,
}

impl SimdLevel {
    /// Number of `f32` lanes per vector register, 1 for scalar.
    pub fn lanes(self) -> usize {
        match self {
            SimdLevel::None => 1,
            SimdLevel::Avx2 => 8,
            SimdLevel::Neon => 4,
        }
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimdLevel::None => write!(f, "none"),
            SimdLevel::Avx2 => write!(f, "avx2"),
            SimdLevel::Neon => write!(f, "neon"),
        }
    }
}

/// What the running binary can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCapabilities {
    pub simd: SimdLevel,
    pub accelerator_compiled: bool,
}

impl KernelCapabilities {
    /// Backends that can run in this process, best first.
    pub fn available_backends(&self) -> Vec<KernelBackend> {
        let mut out = Vec::with_capacity(3);
        if self.accelerator_compiled {
            out.push(KernelBackend::Accelerator);
        }
        if self.simd != SimdLevel::None {
            out.push(KernelBackend::Vectorized);
        }
        out.push(KernelBackend::Scalar);
        out
    }
}

/// The outcome of selecting a backend for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoSelection {
    pub operation: Operation,
    pub requested: Algo,
    pub selected: KernelBackend,
    /// Set when the request was honoured with a weaker backend.
    pub downgraded: bool,
    pub rationale: String,
}

impl AlgoSelection {
    /// Format: `op=forward requested=cpu_simd selected=vectorized`
    pub fn summary(&self) -> String {
        format!("op={} requested={} selected={}", self.operation, self.requested, self.selected)
    }
}

/// Select the backend for `operation`.
///
/// `cpu_simd` has no update body of its own; update falls through to the
/// default rule, as does every operation under `auto`. The default rule picks
/// the accelerator when `prefer_accelerator` is set and the scalar loops
/// otherwise. Landing on the accelerator in a build without it is an error.
pub fn select_backend(
    operation: Operation,
    requested: Algo,
    prefer_accelerator: bool,
    caps: &KernelCapabilities,
) -> Result<AlgoSelection, ConfigError> {
    let default_rule = || {
        if prefer_accelerator {
            (KernelBackend::Accelerator, "default rule: accelerator preferred".to_string())
        } else {
            (KernelBackend::Scalar, "default rule: scalar".to_string())
        }
    };

    let mut downgraded = false;
    let (selected, rationale) = match (requested, operation) {
        (Algo::CpuBase, _) => (KernelBackend::Scalar, "scalar loops requested".to_string()),
        (Algo::CudaBase, _) => {
            (KernelBackend::Accelerator, "accelerator requested".to_string())
        }
        (Algo::CpuSimd, Operation::Forward | Operation::Backward) => {
            if caps.simd == SimdLevel::None {
                downgraded = true;
                (
                    KernelBackend::Scalar,
                    "no SIMD unit detected; falling back to scalar loops".to_string(),
                )
            } else {
                (KernelBackend::Vectorized, format!("{} lanes requested", caps.simd))
            }
        }
        (Algo::CpuSimd, Operation::Update) | (Algo::Auto, _) => default_rule(),
    };

    if selected == KernelBackend::Accelerator && !caps.accelerator_compiled {
        return Err(ConfigError::AcceleratorNotCompiled { operation: operation.to_string() });
    }

    Ok(AlgoSelection { operation, requested, selected, downgraded, rationale })
}
