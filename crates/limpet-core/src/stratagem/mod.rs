//! Checksum-write operation plans.
//!
//! A [`Stratagem`] is the serializable answer to "what sequence of
//! checksum-write commands deposits my payload at my chosen address?" It is
//! produced once per (image, patch list) pair by the synthesizer, saved for
//! later replay against a live target, and never mutated after construction.

pub mod replay;
pub mod synth;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arch::Endian;
use crate::checksum;
use crate::error::Result;

/// Parameters of the checksum the target's write command computes.
///
/// Recorded in every plan so it can be re-verified offline and so a loaded
/// plan is meaningful without the image that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub polynomial: u32,
    pub init_xor: u32,
    pub final_xor: u32,
    /// Byte order of the 4-byte result as the target writes it to memory.
    pub write_endian: Endian,
}

impl Default for ChecksumSpec {
    fn default() -> Self {
        Self {
            polynomial: checksum::POLYNOMIAL,
            init_xor: checksum::INIT_XOR,
            final_xor: checksum::FINAL_XOR,
            write_endian: Endian::Little,
        }
    }
}

impl ChecksumSpec {
    /// Whether the built-in engine implements these parameters.
    pub fn is_supported(&self) -> bool {
        self.polynomial == checksum::POLYNOMIAL
            && self.init_xor == checksum::INIT_XOR
            && self.final_xor == checksum::FINAL_XOR
    }
}

/// One planned checksum-write step.
///
/// Addresses are absolute target addresses, never image-relative, so a
/// stored plan does not need the originating dump to be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Start of the source range the target checksums.
    pub source_addr: u64,
    pub source_len: usize,
    /// Where the target writes the result.
    pub dest: u64,
    /// Expected checksum value, for post-hoc verification.
    pub checksum: u32,
    /// Bytes of the result actually deposited: 4, or fewer for a permitted
    /// partial tail write.
    pub write_len: usize,
}

/// Payload bytes excluded from a plan under
/// [`synth::TailPolicy::WholeWordsOnly`]; surfaced so the caller can see
/// exactly what the plan does not cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedTail {
    pub dest: u64,
    pub bytes: Vec<u8>,
}

/// An ordered, replayable sequence of checksum-write operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stratagem {
    /// Tool version that produced the plan.
    pub version: String,
    pub comment: String,
    pub checksum_spec: ChecksumSpec,
    pub operations: Vec<Operation>,
    /// Partial-word payload tails a `WholeWordsOnly` policy left out.
    #[serde(default)]
    pub excluded_tails: Vec<ExcludedTail>,
}

impl Stratagem {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Total bytes the plan reads from the source image.
    pub fn source_bytes(&self) -> usize {
        self.operations.iter().map(|op| op.source_len).sum()
    }

    /// Total payload bytes the plan deposits.
    pub fn written_bytes(&self) -> usize {
        self.operations.iter().map(|op| op.write_len).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// On-disk envelope around a plan. Provenance lives here rather than in the
/// [`Stratagem`] itself, so plan construction stays deterministic.
#[derive(Debug, Serialize, Deserialize)]
struct StratagemFile {
    saved_at: String,
    stratagem: Stratagem,
}

pub fn save_stratagem<P: AsRef<Path>>(path: P, stratagem: &Stratagem) -> Result<()> {
    let file = StratagemFile {
        saved_at: chrono::Utc::now().to_rfc3339(),
        stratagem: stratagem.clone(),
    };
    let content = serde_json::to_string_pretty(&file)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_stratagem<P: AsRef<Path>>(path: P) -> Result<Stratagem> {
    let content = fs::read_to_string(path)?;
    let file: StratagemFile = serde_json::from_str(&content)?;
    Ok(file.stratagem)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_stratagem() -> Stratagem {
        Stratagem {
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: "unit fixture".to_string(),
            checksum_spec: ChecksumSpec::default(),
            operations: vec![
                Operation {
                    source_addr: 0x8790_1234,
                    source_len: 17,
                    dest: 0x8780_0000,
                    checksum: 0xDEAD_BEEF,
                    write_len: 4,
                },
                Operation {
                    source_addr: 0x8790_0010,
                    source_len: 3,
                    dest: 0x8780_0004,
                    checksum: 0x0102_0304,
                    write_len: 2,
                },
            ],
            excluded_tails: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let stratagem = sample_stratagem();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");

        save_stratagem(&path, &stratagem).unwrap();
        let loaded = load_stratagem(&path).unwrap();
        assert_eq!(loaded, stratagem);
    }

    #[test]
    fn test_totals() {
        let stratagem = sample_stratagem();
        assert_eq!(stratagem.len(), 2);
        assert_eq!(stratagem.source_bytes(), 20);
        assert_eq!(stratagem.written_bytes(), 6);
    }

    #[test]
    fn test_default_spec_is_supported() {
        assert!(ChecksumSpec::default().is_supported());
        let odd = ChecksumSpec {
            polynomial: 0x04C1_1DB7,
            ..ChecksumSpec::default()
        };
        assert!(!odd.is_supported());
    }
}
