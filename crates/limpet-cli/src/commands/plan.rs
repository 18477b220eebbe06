//! Synthesize a checksum-write plan for a payload.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;
use tracing::warn;

use limpet_core::{
    CancelToken, ChecksumSpec, Endian, MemoryPatch, SynthConfig, Synthesizer, TailPolicy,
    save_stratagem,
};

use crate::config::CliConfig;

use super::{load_image, parse_gap, parse_hex_u64};

#[derive(Args)]
pub struct PlanArgs {
    /// Dump of memory readable on the target (the source material)
    #[arg(short, long)]
    image: PathBuf,

    /// Target address of the dump's first byte
    #[arg(short, long, value_parser = parse_hex_u64)]
    base: u64,

    /// Region to exclude as source material, as ADDR:LEN (repeatable)
    #[arg(long, value_parser = parse_gap)]
    gap: Vec<(u64, usize)>,

    /// File containing the payload bytes to deposit
    #[arg(short, long)]
    payload: PathBuf,

    /// Address the payload should land at
    #[arg(short, long, value_parser = parse_hex_u64)]
    dest: u64,

    /// Longest source window to try per start offset
    #[arg(long)]
    max_source_len: Option<usize>,

    /// Emit a short final write for payloads not a multiple of 4 bytes
    /// (default: exclude the tail and report it)
    #[arg(long)]
    allow_partial: bool,

    /// Byte order of the target's checksum write
    #[arg(long, default_value = "little")]
    endian: Endian,

    /// Free-form note recorded in the plan
    #[arg(long, default_value = "")]
    comment: String,

    /// Where to write the plan
    #[arg(short, long, default_value = "stratagem.json")]
    out: PathBuf,
}

pub fn run(args: &PlanArgs, config: &CliConfig) -> Result<()> {
    let image = load_image(&args.image, args.base, &args.gap)?;
    let payload = fs::read(&args.payload)
        .with_context(|| format!("failed to read {}", args.payload.display()))?;
    let patch = MemoryPatch::new(args.dest, payload)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("cancellation requested, finishing current offset range...");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let synth_config = SynthConfig {
        max_source_len: args.max_source_len.unwrap_or(config.max_source_len),
        tail_policy: if args.allow_partial {
            TailPolicy::AllowPartialWrite
        } else {
            TailPolicy::WholeWordsOnly
        },
        checksum_spec: ChecksumSpec {
            write_endian: args.endian,
            ..ChecksumSpec::default()
        },
        comment: args.comment.clone(),
    };

    let mut synth = Synthesizer::new(&image, synth_config).with_cancel(cancel);
    let stratagem = synth.synthesize_patches(vec![patch])?;

    println!(
        "{}: {} operations, {} source bytes read, {} payload bytes written",
        "plan ready".green().bold(),
        stratagem.len(),
        stratagem.source_bytes(),
        stratagem.written_bytes()
    );
    for tail in &stratagem.excluded_tails {
        println!(
            "{}: {} byte tail at {:#x} not covered (rerun with --allow-partial)",
            "excluded".yellow().bold(),
            tail.bytes.len(),
            tail.dest
        );
    }

    save_stratagem(&args.out, &stratagem)?;
    println!("saved to {}", args.out.display());
    Ok(())
}
