//! Flattened device tree matcher.
//!
//! Probes for the FDT magic and validates the v17 header's size and offset
//! fields against the search window before accepting. A blob whose header
//! points outside the window is a false positive, not an error.

use memchr::memmem;
use serde::Serialize;
use tracing::debug;

use crate::image::Image;

use super::{FindingKind, Hit, Hunt, Probe};

const FDT_MAGIC: [u8; 4] = [0xD0, 0x0D, 0xFE, 0xED];

/// Header length covered by the validation checks (10 big-endian words).
const FDT_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FdtDetails {
    pub version: u32,
    pub total_size: u32,
    pub struct_size: u32,
    pub strings_size: u32,
}

#[derive(Debug, Default)]
pub struct FdtMatcher;

impl FdtMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Validate the header at `offset`; `None` rules out a false positive.
    fn header_at(&self, image: &Image, offset: usize, end: usize) -> Option<FdtDetails> {
        let header = image.slice(offset, FDT_HEADER_LEN)?;
        let field = |idx: usize| {
            let b = &header[idx * 4..idx * 4 + 4];
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        };

        let avail = (end - offset) as u64;
        let total_size = field(1);
        if total_size as u64 > avail || (total_size as usize) < FDT_HEADER_LEN {
            debug!("rejecting FDT candidate at {:#x}: totalsize {:#x}", offset, total_size);
            return None;
        }

        let off_dt_struct = field(2);
        let off_dt_strings = field(3);
        let off_mem_rsvmap = field(4);
        for block_off in [off_dt_struct, off_dt_strings, off_mem_rsvmap] {
            if block_off as u64 > total_size as u64 {
                return None;
            }
        }

        let strings_size = field(8);
        let struct_size = field(9);
        if off_dt_strings as u64 + strings_size as u64 > total_size as u64 {
            return None;
        }
        if off_dt_struct as u64 + struct_size as u64 > total_size as u64 {
            return None;
        }

        Some(FdtDetails {
            version: field(5),
            total_size,
            struct_size,
            strings_size,
        })
    }
}

impl Hunt for FdtMatcher {
    type Details = FdtDetails;
    const KIND: FindingKind = FindingKind::DeviceTree;

    fn probe(&self, image: &Image, window: std::ops::Range<usize>) -> Probe<FdtDetails> {
        let mut cursor = window.start;
        while cursor < window.end {
            let rel = match memmem::find(&image.bytes()[cursor..window.end], &FDT_MAGIC) {
                Some(rel) => rel,
                None => return Probe::Exhausted,
            };
            let offset = cursor + rel;

            if let Some(details) = self.header_at(image, offset, window.end) {
                return Probe::Hit(Hit {
                    offset,
                    size: details.total_size as usize,
                    details,
                });
            }

            // Invalid header; resume past this magic word.
            cursor = offset + FDT_MAGIC.len();
        }
        Probe::Exhausted
    }
}
