//! Target architecture parameters used when decoding in-image structures.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Byte order of multi-byte values, both in-image and for the 4-byte
/// checksum result the target writes to memory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Target architectures whose bootloader images this tool understands.
///
/// Only the properties the matchers care about are modeled: machine word
/// size (pointer stride in dispatch tables) and byte order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    Arm,
    #[strum(serialize = "armbe")]
    #[serde(rename = "armbe")]
    ArmBig,
    Aarch64,
    Mips,
    Mipsel,
}

impl Arch {
    pub fn word_size(self) -> usize {
        match self {
            Arch::Arm | Arch::ArmBig | Arch::Mips | Arch::Mipsel => 4,
            Arch::Aarch64 => 8,
        }
    }

    pub fn endian(self) -> Endian {
        match self {
            Arch::Arm | Arch::Mipsel | Arch::Aarch64 => Endian::Little,
            Arch::ArmBig | Arch::Mips => Endian::Big,
        }
    }

    pub fn is_word_aligned(self, addr: u64) -> bool {
        addr.is_multiple_of(self.word_size() as u64)
    }

    /// Decode one machine word from the front of `bytes`.
    ///
    /// Returns `None` when fewer than `word_size` bytes remain; matchers
    /// treat that as a structural mismatch, not an error.
    pub fn read_word(self, bytes: &[u8]) -> Option<u64> {
        let size = self.word_size();
        let raw = bytes.get(..size)?;
        let value = match (size, self.endian()) {
            (4, Endian::Little) => u32::from_le_bytes(raw.try_into().ok()?) as u64,
            (4, Endian::Big) => u32::from_be_bytes(raw.try_into().ok()?) as u64,
            (8, Endian::Little) => u64::from_le_bytes(raw.try_into().ok()?),
            _ => u64::from_be_bytes(raw.try_into().ok()?),
        };
        Some(value)
    }

    /// Decode one machine word as a signed value (e.g. an argument-count
    /// field that occupies a full word slot in the record layout).
    pub fn read_int(self, bytes: &[u8]) -> Option<i64> {
        let word = self.read_word(bytes)?;
        let value = match self.word_size() {
            4 => word as u32 as i32 as i64,
            _ => word as i64,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_word_decoding() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xAA];
        assert_eq!(Arch::Arm.read_word(&bytes), Some(0x1234_5678));
        assert_eq!(Arch::ArmBig.read_word(&bytes), Some(0x7856_3412));
        assert_eq!(Arch::Aarch64.read_word(&bytes), None);

        let wide = [0x01, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Arch::Aarch64.read_word(&wide), Some(1));
    }

    #[test]
    fn test_signed_read() {
        let bytes = (-1i32).to_le_bytes();
        assert_eq!(Arch::Arm.read_int(&bytes), Some(-1));
    }

    #[test]
    fn test_arch_from_str() {
        assert_eq!(Arch::from_str("arm").unwrap(), Arch::Arm);
        assert_eq!(Arch::from_str("armbe").unwrap(), Arch::ArmBig);
        assert_eq!(Arch::from_str("aarch64").unwrap(), Arch::Aarch64);
        assert!(Arch::from_str("z80").is_err());
    }

    #[test]
    fn test_alignment() {
        assert!(Arch::Arm.is_word_aligned(0x8000_0004));
        assert!(!Arch::Arm.is_word_aligned(0x8000_0002));
        assert!(!Arch::Aarch64.is_word_aligned(0x8000_0004));
    }
}
