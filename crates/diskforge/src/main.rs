//! # diskforge
//!
//! Build a bootable disk image for a 32-bit bare-metal target.
//!
//! ## Usage
//!
//! ```bash
//! diskforge all                  # Runtime + kernel + programs + image
//! diskforge runtime              # Build stale runtime layers
//! diskforge runtime-layer alloc  # Build one layer against built prerequisites
//! diskforge kernel               # Compile and link the kernel
//! diskforge programs             # Build every program
//! diskforge manifest --list      # Show filesystem ids
//! diskforge image                # Assemble from built artifacts
//! diskforge inspect <image>      # Decode an image's segments and manifest
//! diskforge status               # Show the last build report
//! ```
//!
//! Settings come from `diskforge.toml` in the current directory unless
//! `--config` names another file.

use anyhow::Result;
use clap::Parser;
use diskforge::BuildError;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "diskforge", about = "Freestanding disk image builder", version)]
struct Cli {
    /// Config file (default: ./diskforge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: commands::BuildCommands,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let result = commands::run(cli.command, cli.config.as_deref());
    if let Some(stage) = result
        .as_ref()
        .err()
        .and_then(|e| e.downcast_ref::<BuildError>())
        .and_then(BuildError::stage)
    {
        log::error!("[{stage}] stage failed");
    }
    result
}
