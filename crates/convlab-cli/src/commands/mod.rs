//! Subcommands of the `convlab` binary.

mod grad_check;
mod info;

pub use grad_check::GradCheckCommand;
pub use info::InfoCommand;
