//! convlab CLI application
//!
//! Runs the finite-difference gradient check of the 2-D convolution layer
//! and reports which kernel body each operation would use on this host.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use convlab_common::RunConfig;
use std::path::PathBuf;
use tracing::debug;

mod commands;
mod exit;

use commands::{GradCheckCommand, InfoCommand};
use exit::{EXIT_SUCCESS, code_for};

/// convlab - 2-D convolution kernels and gradient check
#[derive(Parser)]
#[command(name = "convlab")]
#[command(about = "2-D convolution layer with scalar, SIMD and CUDA kernels")]
#[command(long_about = r#"
Trainable 2-D convolution layer (unit stride, no padding) with interchangeable
scalar, SIMD and CUDA kernel bodies, checked against central differences.

Examples:
  # Gradient check of the 28x28 digit layer, 5 runs, batch 16
  convlab grad-check -b 16 -e 5

  # Force the vectorized kernels
  convlab grad-check -a cpu_simd

  # Show capabilities and backend selection
  convlab info

Options are read from --config (TOML) and CONVLAB_* environment variables;
command-line flags take precedence.
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(
        long,
        value_name = "FORMAT",
        global = true,
        value_enum,
        default_value_t = LogFormat::Pretty
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare analytic gradients with central differences (default)
    #[command(alias = "check")]
    GradCheck(GradCheckCommand),

    /// Show system information and backend selection
    Info(InfoCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    let result = load_configuration(&cli).and_then(|options| match cli.command {
        Some(Commands::GradCheck(cmd)) => cmd.execute(options),
        Some(Commands::Info(cmd)) => cmd.execute(options),
        None => GradCheckCommand::default().execute(options),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  Caused by: {cause}");
        }
        std::process::exit(code_for(&e));
    }
    std::process::exit(EXIT_SUCCESS);
}

/// Load options from the config file when given, else from defaults; both
/// paths apply `CONVLAB_*` overrides.
fn load_configuration(cli: &Cli) -> Result<RunConfig> {
    let options = match &cli.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => RunConfig::from_env().context("failed to read configuration from environment")?,
    };
    debug!(?options, "configuration loaded");
    Ok(options)
}

/// Logs go to stderr so that stdout carries only results.
fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
        }
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}
