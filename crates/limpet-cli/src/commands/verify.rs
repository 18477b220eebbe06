//! Replay a saved plan against a checksum engine simulation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use limpet_core::{Endian, Simulator, load_stratagem};

use crate::config::CliConfig;

use super::{load_image, parse_hex_u64};

#[derive(Args)]
pub struct VerifyArgs {
    /// Plan file produced by `limpet plan`
    #[arg(short, long)]
    stratagem: PathBuf,

    /// Dump the plan was synthesized against
    #[arg(short, long)]
    image: PathBuf,

    /// Target address of the dump's first byte
    #[arg(short, long, value_parser = parse_hex_u64)]
    base: u64,
}

pub fn run(args: &VerifyArgs, _config: &CliConfig) -> Result<()> {
    let stratagem = load_stratagem(&args.stratagem)
        .with_context(|| format!("failed to load {}", args.stratagem.display()))?;
    let image = load_image(&args.image, args.base, &[])?;

    println!(
        "verifying {} operations from {}",
        stratagem.len(),
        args.stratagem.display()
    );

    let mut sim = Simulator::new(&image);
    sim.run(&stratagem)?;

    // Checksums matched; confirm every destination holds its result bytes.
    for (index, op) in stratagem.operations.iter().enumerate() {
        let word = match stratagem.checksum_spec.write_endian {
            Endian::Little => op.checksum.to_le_bytes(),
            Endian::Big => op.checksum.to_be_bytes(),
        };
        let written = sim.read(op.dest, op.write_len)?;
        if written != word[..op.write_len] {
            anyhow::bail!(
                "operation {index}: destination {:#x} holds {:02X?}, expected {:02X?}",
                op.dest,
                written,
                &word[..op.write_len]
            );
        }
        println!(
            "  [{index}] {} {:#010x} -> {:#x} ({} bytes)",
            "ok".green(),
            op.checksum,
            op.dest,
            op.write_len
        );
    }

    println!("{}", "plan verified".green().bold());
    Ok(())
}
