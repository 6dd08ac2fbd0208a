//! Common types, errors and configuration for convlab
//!
//! This crate provides the foundational pieces shared by the kernel crate and
//! the CLI: the scalar type, the error taxonomy, run options loaded from TOML
//! and the environment, per-operation algorithm selection and the seeded
//! random generator.

pub mod algo_selection;
pub mod config;
pub mod error;
pub mod rng;
pub mod types;

pub use algo_selection::{
    Algo, AlgoSelection, KernelBackend, KernelCapabilities, Operation, SimdLevel, select_backend,
};
pub use config::{MAX_BATCH_SIZE, RunConfig};
pub use error::*;
pub use rng::RandomGen;
pub use types::*;
