//! CPU kernel implementations

pub mod fallback;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub mod arm;

pub use fallback::*;

#[cfg(target_arch = "x86_64")]
pub use x86::*;

#[cfg(target_arch = "aarch64")]
pub use arm::*;

#[cfg(not(target_arch = "x86_64"))]
pub use crate::stubs::Avx2Kernel;

#[cfg(not(target_arch = "aarch64"))]
pub use crate::stubs::NeonKernel;
