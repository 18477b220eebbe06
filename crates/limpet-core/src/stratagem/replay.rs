//! Offline stratagem execution.
//!
//! The real executor issues the target's checksum-write command over a
//! console; this simulator stands in for it. It models the target address
//! space as the source image plus a sparse overlay of written bytes, so
//! plans whose later operations read back earlier results behave exactly as
//! they would on hardware. Every operation's computed checksum is compared
//! against the value recorded in the plan before its write lands.

use std::collections::BTreeMap;

use tracing::debug;

use crate::arch::Endian;
use crate::checksum::Crc32;
use crate::error::{Error, Result};
use crate::image::Image;

use super::Stratagem;

pub struct Simulator {
    base: u64,
    bytes: Vec<u8>,
    /// Writes landing outside the image range.
    overlay: BTreeMap<u64, u8>,
}

impl Simulator {
    pub fn new(image: &Image) -> Self {
        Self {
            base: image.base(),
            bytes: image.bytes().to_vec(),
            overlay: BTreeMap::new(),
        }
    }

    fn read_byte(&self, addr: u64) -> Option<u8> {
        if let Some(&byte) = self.overlay.get(&addr) {
            return Some(byte);
        }
        let offset = addr.checked_sub(self.base)? as usize;
        self.bytes.get(offset).copied()
    }

    fn write_byte(&mut self, addr: u64, byte: u8) {
        match addr
            .checked_sub(self.base)
            .map(|off| off as usize)
            .filter(|&off| off < self.bytes.len())
        {
            Some(offset) => self.bytes[offset] = byte,
            None => {
                self.overlay.insert(addr, byte);
            }
        }
    }

    /// Read simulated memory, for post-replay assertions.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let byte = addr
                .checked_add(i as u64)
                .and_then(|at| self.read_byte(at))
                .ok_or(Error::UnmappedAddress { addr, len })?;
            out.push(byte);
        }
        Ok(out)
    }

    /// Execute every operation in stored order, verifying each computed
    /// checksum against the plan's expected value.
    pub fn run(&mut self, stratagem: &Stratagem) -> Result<()> {
        if !stratagem.checksum_spec.is_supported() {
            return Err(Error::ChecksumSpecUnsupported);
        }

        for (index, op) in stratagem.operations.iter().enumerate() {
            let source = self.read(op.source_addr, op.source_len)?;
            let mut crc = Crc32::new();
            crc.update(&source);
            let value = crc.value();
            if value != op.checksum {
                return Err(Error::ReplayMismatch {
                    index,
                    expected: op.checksum,
                    actual: value,
                });
            }

            let word = match stratagem.checksum_spec.write_endian {
                Endian::Little => value.to_le_bytes(),
                Endian::Big => value.to_be_bytes(),
            };
            for (i, &byte) in word.iter().take(op.write_len).enumerate() {
                let at = op.dest.checked_add(i as u64).ok_or(Error::UnmappedAddress {
                    addr: op.dest,
                    len: op.write_len,
                })?;
                self.write_byte(at, byte);
            }
            debug!(
                "replayed operation {}: {:#010x} -> {:#x}",
                index, value, op.dest
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::crc32;
    use crate::patch::MemoryPatch;
    use crate::stratagem::synth::{SynthConfig, Synthesizer};
    use crate::stratagem::{ChecksumSpec, Operation};
    use crate::testutil::pseudo_random;

    #[test]
    fn test_synthesized_plan_replays_to_payload() {
        let bytes = pseudo_random(8 * 1024, 0x5EED_0001);
        let image = Image::new(bytes.clone(), 0x87F0_0000).unwrap();

        // Word values drawn from the image itself, so windows exist.
        let mut payload = crc32(&bytes[10..40]).to_le_bytes().to_vec();
        payload.extend_from_slice(&crc32(&bytes[100..101]).to_le_bytes());
        let patch = MemoryPatch::new(0x8780_0000, payload.clone()).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();

        let mut sim = Simulator::new(&image);
        sim.run(&stratagem).unwrap();
        assert_eq!(sim.read(0x8780_0000, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_replay_follows_dependent_reads() {
        // A plan whose first write deposits bytes that a later operation
        // then sources from the destination area.
        let image = Image::new(vec![0u8; 64], 0x1000).unwrap();
        let first_value = crc32(&[0]);
        let second_value = crc32(&first_value.to_le_bytes());

        let stratagem = crate::stratagem::Stratagem {
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: String::new(),
            checksum_spec: ChecksumSpec::default(),
            operations: vec![
                Operation {
                    source_addr: 0x1000,
                    source_len: 1,
                    dest: 0x9000_0000,
                    checksum: first_value,
                    write_len: 4,
                },
                Operation {
                    source_addr: 0x9000_0000,
                    source_len: 4,
                    dest: 0x9000_0004,
                    checksum: second_value,
                    write_len: 4,
                },
            ],
            excluded_tails: Vec::new(),
        };

        let mut sim = Simulator::new(&image);
        sim.run(&stratagem).unwrap();
        assert_eq!(
            sim.read(0x9000_0004, 4).unwrap(),
            second_value.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let image = Image::new(vec![0u8; 64], 0x1000).unwrap();
        let stratagem = crate::stratagem::Stratagem {
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: String::new(),
            checksum_spec: ChecksumSpec::default(),
            operations: vec![Operation {
                source_addr: 0x1000,
                source_len: 4,
                dest: 0x9000_0000,
                checksum: 0x1234_5678, // wrong on purpose
                write_len: 4,
            }],
            excluded_tails: Vec::new(),
        };

        let mut sim = Simulator::new(&image);
        let err = sim.run(&stratagem).unwrap_err();
        assert!(matches!(
            err,
            Error::ReplayMismatch {
                index: 0,
                expected: 0x1234_5678,
                ..
            }
        ));
    }

    #[test]
    fn test_unmapped_source_rejected() {
        let image = Image::new(vec![0u8; 64], 0x1000).unwrap();
        let stratagem = crate::stratagem::Stratagem {
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: String::new(),
            checksum_spec: ChecksumSpec::default(),
            operations: vec![Operation {
                source_addr: 0x5000,
                source_len: 4,
                dest: 0x9000_0000,
                checksum: 0,
                write_len: 4,
            }],
            excluded_tails: Vec::new(),
        };

        let mut sim = Simulator::new(&image);
        assert!(matches!(
            sim.run(&stratagem),
            Err(Error::UnmappedAddress { .. })
        ));
    }
}
