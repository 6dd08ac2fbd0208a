//! `convlab info`

use anyhow::Result;
use clap::Args;
use convlab_common::{Algo, Operation, RunConfig, select_backend};
use convlab_kernels::detect_capabilities;

/// Show detected capabilities and per-operation backend selection.
#[derive(Args, Debug, Clone, Default)]
pub struct InfoCommand {
    /// Algorithm to resolve instead of the configured one
    #[arg(short = 'a', long = "algo", value_name = "ALGO")]
    pub algo: Option<Algo>,
}

impl InfoCommand {
    pub fn execute(&self, options: RunConfig) -> Result<()> {
        let caps = detect_capabilities();
        let algo = self.algo.unwrap_or(options.algo);

        println!("convlab {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("System:");
        println!("  OS: {}", std::env::consts::OS);
        println!("  Architecture: {}", std::env::consts::ARCH);
        println!("  SIMD: {} ({} lanes)", caps.simd, caps.simd.lanes());
        println!(
            "  Accelerator: {}",
            if caps.accelerator_compiled { "compiled" } else { "not compiled" }
        );
        let backends: Vec<String> =
            caps.available_backends().iter().map(ToString::to_string).collect();
        println!("  Backends: {}", backends.join(", "));
        println!();

        println!("Selection (prefer_accelerator={}):", options.prefer_accelerator);
        for op in [Operation::Forward, Operation::Backward, Operation::Update] {
            let sel = select_backend(op, algo, options.prefer_accelerator, &caps)?;
            let note = if sel.downgraded { " (downgraded)" } else { "" };
            println!("  {}{note}: {}", sel.summary(), sel.rationale);
        }
        Ok(())
    }
}
