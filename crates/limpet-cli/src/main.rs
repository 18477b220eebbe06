use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{hexdump, hunt, plan, verify};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "limpet")]
#[command(about = "Bootloader dump analysis and checksum-write planning")]
#[command(version)]
struct Cli {
    /// Configuration file with flag defaults
    #[arg(short, long, default_value = "limpet.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search a dump for binary structures
    Hunt(hunt::HuntArgs),
    /// Synthesize a checksum-write plan for a payload
    Plan(plan::PlanArgs),
    /// Replay a saved plan against a checksum simulation
    Verify(verify::VerifyArgs),
    /// Dump a region of an image as hex
    Hexdump(hexdump::HexdumpArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("limpet=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match CliConfig::load(&cli.config) {
        Ok(Some(config)) => {
            debug!("loaded config from {}", cli.config.display());
            config
        }
        Ok(None) => CliConfig::default(),
        Err(e) => {
            warn!("failed to load {}: {e}, using defaults", cli.config.display());
            CliConfig::default()
        }
    };

    match &cli.command {
        Command::Hunt(args) => hunt::run(args, &config),
        Command::Plan(args) => plan::run(args, &config),
        Command::Verify(args) => verify::run(args, &config),
        Command::Hexdump(args) => hexdump::run(args, &config),
    }
}
