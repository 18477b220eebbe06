//! CLI command implementations.

pub mod hexdump;
pub mod hunt;
pub mod plan;
pub mod verify;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use limpet_core::Image;
use tracing::info;

/// Parse an integer that may be given as hex (`0x...`) or decimal.
pub fn parse_hex_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

/// Parse an `ADDR:LEN` exclusion gap specification.
pub fn parse_gap(s: &str) -> std::result::Result<(u64, usize), String> {
    let Some((addr, len)) = s.split_once(':') else {
        return Err(format!("expected ADDR:LEN, got {s:?}"));
    };
    let addr = parse_hex_u64(addr)?;
    let len = parse_hex_u64(len)? as usize;
    Ok((addr, len))
}

/// Parse a hex byte string such as `deadbeef` or `de ad be ef`.
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact
        .strip_prefix("0x")
        .or_else(|| compact.strip_prefix("0X"))
        .unwrap_or(&compact);
    if compact.is_empty() || !compact.len().is_multiple_of(2) {
        bail!("hex byte string must contain an even number of digits: {s:?}");
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&compact[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte in {s:?}"))
        })
        .collect()
}

/// Load a dump file into an [`Image`] at the given base address.
pub fn load_image(path: &Path, base: u64, gaps: &[(u64, usize)]) -> Result<Image> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    info!(
        "loaded {} ({} bytes) at base {:#x}",
        path.display(),
        bytes.len(),
        base
    );
    Ok(Image::with_gaps(bytes, base, gaps)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x8780beef").unwrap(), 0x8780_BEEF);
        assert_eq!(parse_hex_u64("512").unwrap(), 512);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn test_parse_gap() {
        assert_eq!(parse_gap("0x1000:0x40").unwrap(), (0x1000, 0x40));
        assert!(parse_gap("0x1000").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(
            parse_hex_bytes("de ad be ef").unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
        assert_eq!(parse_hex_bytes("0x0102").unwrap(), vec![1, 2]);
        assert!(parse_hex_bytes("abc").is_err());
    }
}
