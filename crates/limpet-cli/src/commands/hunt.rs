//! Structure search over a dump file.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use owo_colors::OwoColorize;
use serde::Serialize;

use limpet_core::{
    Arch, CmdTableDetails, CmdTableMatcher, CmdTableOptions, ConstantMatcher, EnvMatcher,
    EnvOptions, FdtMatcher, Finding, Image, find_iter,
};

use crate::config::CliConfig;

use super::{load_image, parse_gap, parse_hex_bytes, parse_hex_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    /// Console command dispatch tables
    Cmdtbl,
    /// Stored or built-in environments
    Env,
    /// Flattened device trees
    Fdt,
    /// Exact byte pattern (requires --pattern)
    Constant,
}

#[derive(Args)]
pub struct HuntArgs {
    /// Dump file to search
    #[arg(short, long)]
    image: PathBuf,

    /// Target address of the dump's first byte
    #[arg(short, long, value_parser = parse_hex_u64, default_value = "0")]
    base: u64,

    /// Structure kind to search for
    #[arg(short, long, value_enum)]
    kind: Kind,

    /// Target architecture (arm, armbe, aarch64, mips, mipsel)
    #[arg(long)]
    arch: Option<String>,

    /// Search window start address (defaults to the image start)
    #[arg(long, value_parser = parse_hex_u64)]
    start: Option<u64>,

    /// Search window end address, exclusive (defaults to the image end)
    #[arg(long, value_parser = parse_hex_u64)]
    end: Option<u64>,

    /// Region to exclude from the search, as ADDR:LEN (repeatable)
    #[arg(long, value_parser = parse_gap)]
    gap: Vec<(u64, usize)>,

    /// Consecutive valid records required for a command-table match
    #[arg(long)]
    threshold: Option<usize>,

    /// Skip pointer range validation (expect false positives)
    #[arg(long)]
    no_check_pointers: bool,

    /// Also probe handler pointers for nested sub-tables
    #[arg(long)]
    nested: bool,

    /// Only report command tables defining this command
    #[arg(long)]
    name: Option<String>,

    /// Minimum variable definitions for an environment match
    #[arg(long)]
    min_entries: Option<usize>,

    /// Only report environments containing this text
    #[arg(long)]
    contains: Option<String>,

    /// Byte pattern for --kind constant, as hex digits
    #[arg(long)]
    pattern: Option<String>,

    /// Emit results as JSON instead of human-readable text
    #[arg(long)]
    json: bool,
}

pub fn run(args: &HuntArgs, config: &CliConfig) -> Result<()> {
    let image = load_image(&args.image, args.base, &args.gap)?;
    let (start, end) = resolve_window(args, &image)?;

    let arch_name = args.arch.as_deref().unwrap_or(&config.arch);
    let arch = Arch::from_str(arch_name)
        .map_err(|_| anyhow::anyhow!("unknown architecture {arch_name:?}"))?;

    match args.kind {
        Kind::Cmdtbl => {
            let opts = CmdTableOptions {
                threshold: args.threshold.unwrap_or(config.threshold),
                check_pointers: !args.no_check_pointers,
                include_nested: args.nested,
                name: args.name.clone(),
                ..CmdTableOptions::default()
            };
            let matcher = CmdTableMatcher::new(arch, opts);
            let findings: Vec<_> = find_iter(&matcher, &image, start, end)?.collect();
            report(args.json, &findings, print_cmd_table)?;
        }
        Kind::Env => {
            let opts = EnvOptions {
                min_entries: args.min_entries.unwrap_or(config.env_min_entries),
                endian: arch.endian(),
                contains: args.contains.clone(),
                ..EnvOptions::default()
            };
            let matcher = EnvMatcher::new(opts);
            let findings: Vec<_> = find_iter(&matcher, &image, start, end)?.collect();
            report(args.json, &findings, |f| {
                println!(
                    "{} environment @ {:#010x} (file offset {:#x}) - {} bytes, {} variables",
                    f.details.kind.to_string().bold(),
                    f.address,
                    f.offset,
                    f.size,
                    f.details.entries.len()
                );
                if let Some(crc) = f.details.checksum {
                    println!("   header checksum: {crc:#010x}");
                }
                if let Some(flags) = f.details.flags {
                    println!("   flags: {flags:#04x}");
                }
                for (name, value) in &f.details.entries {
                    println!("   {name}={value}");
                }
                println!();
            })?;
        }
        Kind::Fdt => {
            let matcher = FdtMatcher::new();
            let findings: Vec<_> = find_iter(&matcher, &image, start, end)?.collect();
            report(args.json, &findings, |f| {
                println!(
                    "{} @ {:#010x} (file offset {:#x}) - {} bytes, version {}",
                    "device tree".bold(),
                    f.address,
                    f.offset,
                    f.details.total_size,
                    f.details.version
                );
            })?;
        }
        Kind::Constant => {
            let Some(pattern) = &args.pattern else {
                bail!("--kind constant requires --pattern");
            };
            let needle = parse_hex_bytes(pattern).context("invalid --pattern")?;
            let matcher = ConstantMatcher::new(needle);
            let findings: Vec<_> = find_iter(&matcher, &image, start, end)?.collect();
            report(args.json, &findings, |f| {
                println!(
                    "{} @ {:#010x} (file offset {:#x}) - {} bytes",
                    "constant".bold(),
                    f.address,
                    f.offset,
                    f.size
                );
            })?;
        }
    }

    Ok(())
}

fn resolve_window(args: &HuntArgs, image: &Image) -> Result<(usize, usize)> {
    let start = match args.start {
        Some(addr) => image
            .offset_of(addr)
            .with_context(|| format!("--start {addr:#x} is outside the image"))?,
        None => 0,
    };
    let end = match args.end {
        Some(addr) if addr == image.base() + image.len() as u64 => image.len(),
        Some(addr) => image
            .offset_of(addr)
            .with_context(|| format!("--end {addr:#x} is outside the image"))?,
        None => image.len(),
    };
    Ok((start, end))
}

fn report<D: Serialize>(
    json: bool,
    findings: &[Finding<D>],
    mut print: impl FnMut(&Finding<D>),
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(findings)?);
        return Ok(());
    }
    if findings.is_empty() {
        println!("{}", "no results".dimmed());
        return Ok(());
    }
    for finding in findings {
        print(finding);
    }
    println!("{} result(s)", findings.len());
    Ok(())
}

fn print_cmd_table(finding: &Finding<CmdTableDetails>) {
    print_one_table(finding, false);
    for sub in &finding.details.sub_tables {
        print_one_table(sub, true);
    }
}

fn print_one_table(finding: &Finding<CmdTableDetails>, nested: bool) {
    let label = if finding.details.is_subcmd_table {
        "Sub-command table"
    } else {
        "Command table"
    };
    let marker = if nested { " (nested)" } else { "" };
    println!(
        "{}{} @ {:#010x} (file offset {:#x}) - {} bytes, {} entries",
        label.bold(),
        marker,
        finding.address,
        finding.offset,
        finding.size,
        finding.details.entries.len()
    );
    println!(
        "   longhelp={}, autocomplete={}",
        finding.details.longhelp, finding.details.autocomplete
    );
    for (i, entry) in finding.details.entries.iter().enumerate() {
        println!(
            "   [{i}] @ {:#010x} {} (maxargs {}, handler {:#010x})",
            entry.address,
            entry.name.green(),
            entry.maxargs,
            entry.handler
        );
        if !entry.usage.is_empty() {
            println!("        usage: {}", entry.usage.trim_end());
        }
    }
    println!();
}
