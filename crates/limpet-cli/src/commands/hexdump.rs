//! Hexdump of an image region.
//!
//! ```text
//! 0x87800000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::CliConfig;

use super::{load_image, parse_hex_u64};

#[derive(Args)]
pub struct HexdumpArgs {
    /// Dump file to read
    #[arg(short, long)]
    image: PathBuf,

    /// Target address of the dump's first byte
    #[arg(short, long, value_parser = parse_hex_u64, default_value = "0")]
    base: u64,

    /// Address to dump from
    #[arg(short, long, value_parser = parse_hex_u64)]
    addr: u64,

    /// Bytes to dump
    #[arg(short, long, default_value = "256")]
    size: usize,
}

pub fn run(args: &HexdumpArgs, _config: &CliConfig) -> Result<()> {
    let image = load_image(&args.image, args.base, &[])?;
    let offset = image
        .offset_of(args.addr)
        .with_context(|| format!("address {:#x} is outside the image", args.addr))?;
    let size = args.size.min(image.len() - offset);
    let bytes = image
        .slice(offset, size)
        .context("requested range is outside the image")?;

    for (i, chunk) in bytes.chunks(16).enumerate() {
        print!("{:#010x}: ", args.addr + (i * 16) as u64);

        for (j, byte) in chunk.iter().enumerate() {
            if j == 8 {
                print!(" ");
            }
            print!("{byte:02X} ");
        }
        for j in chunk.len()..16 {
            if j == 8 {
                print!(" ");
            }
            print!("   ");
        }

        print!(" |");
        for byte in chunk {
            if (0x20..0x7F).contains(byte) {
                print!("{}", *byte as char);
            } else {
                print!(".");
            }
        }
        for _ in chunk.len()..16 {
            print!(" ");
        }
        println!("|");
    }

    Ok(())
}
