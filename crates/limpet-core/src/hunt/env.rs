//! Bootloader environment matcher.
//!
//! An environment is a block of NUL-terminated `key=value` ASCII strings
//! ending in a double NUL. Stored copies are prefixed with a CRC32 header
//! word (and, for redundant dual-copy setups, a one-byte flags field
//! between header and data). Built-in defaults compiled into the
//! bootloader image carry no header at all.
//!
//! The stored-copy header checksum covers the *declared* environment size,
//! which is larger than the used portion; validation therefore extends the
//! candidate region byte by byte with the rolling checksum engine until the
//! stored value matches or the configured cap is reached.

use std::collections::BTreeMap;

use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};

use crate::arch::Endian;
use crate::checksum::Crc32;
use crate::image::Image;

use super::{FindingKind, Hit, Hunt, Probe};

/// How an environment instance is framed in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum EnvKind {
    /// Compiled-in defaults, no checksum header.
    Builtin,
    /// Stored copy: CRC32 header followed by data.
    Stored,
    /// Stored copy with a flags byte between header and data.
    StoredRedundant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvDetails {
    pub kind: EnvKind,
    /// Stored header checksum, absent for built-in instances.
    pub checksum: Option<u32>,
    /// Active-copy flags byte, present only for redundant instances.
    pub flags: Option<u8>,
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Minimum variable definitions for a block to count.
    pub min_entries: usize,
    /// Reject blocks with more definitions than this.
    pub max_entries: Option<usize>,
    /// Cap on the declared region size searched during header validation.
    pub max_size: usize,
    /// Whether the image uses redundant environments. `None` tries both.
    pub redundant: Option<bool>,
    /// Byte order of the stored header word.
    pub endian: Endian,
    /// Only report environments whose raw definitions contain this text.
    pub contains: Option<String>,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            min_entries: 5,
            max_entries: None,
            max_size: 0x20000,
            redundant: None,
            endian: Endian::Little,
            contains: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct EnvMatcher {
    opts: EnvOptions,
}

fn is_name_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) && b != b'='
}

fn is_value_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || b == b'\t' || b == b'\n' || b == b'\r'
}

/// Parse consecutive `name=value\0` definitions starting at `start`.
/// Returns the offset just past the last definition's NUL and the count.
fn parse_block(data: &[u8], start: usize, end: usize) -> Option<(usize, usize)> {
    let mut cur = start;
    let mut count = 0;

    loop {
        let mut i = cur;
        while i < end && is_name_byte(data[i]) {
            i += 1;
        }
        if i == cur || i >= end || data[i] != b'=' {
            break;
        }
        i += 1;
        let value_start = i;
        while i < end && is_value_byte(data[i]) {
            i += 1;
        }
        if i == value_start || i >= end || data[i] != 0 {
            break;
        }
        cur = i + 1;
        count += 1;

        if cur >= end || data[cur] == 0 {
            break;
        }
    }

    if count == 0 {
        return None;
    }
    // Double-NUL terminated (or block runs to the end of the window).
    if cur < end && data[cur] != 0 {
        return None;
    }
    Some((cur, count))
}

/// Parse `name=value\0` definitions in `region` into a map.
fn parse_entries(region: &[u8]) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    let end = region.len();
    let mut cur = 0;
    while cur < end && region[cur] != 0 {
        let mut i = cur;
        while i < end && is_name_byte(region[i]) {
            i += 1;
        }
        if i >= end || region[i] != b'=' {
            break;
        }
        let name = String::from_utf8_lossy(&region[cur..i]).into_owned();
        i += 1;
        let value_start = i;
        while i < end && region[i] != 0 {
            i += 1;
        }
        let value = String::from_utf8_lossy(&region[value_start..i]).into_owned();
        entries.insert(name, value);
        cur = i + 1;
    }
    entries
}

impl EnvMatcher {
    pub fn new(opts: EnvOptions) -> Self {
        Self { opts }
    }

    /// Slide the rolling checksum over `[start, start + min_size)` and keep
    /// extending until the stored value matches. Returns the declared size.
    fn declared_size(
        &self,
        data: &[u8],
        start: usize,
        min_size: usize,
        end: usize,
        expected: u32,
    ) -> Option<usize> {
        if start + min_size > data.len() {
            return None;
        }
        let mut crc = Crc32::new();
        crc.update(&data[start..start + min_size]);
        if crc.value() == expected {
            return Some(min_size);
        }

        let cap = end.min(start.saturating_add(self.opts.max_size));
        for i in start + min_size..cap {
            crc.push(data[i]);
            if crc.value() == expected {
                return Some(i - start + 1);
            }
        }
        None
    }

    fn header_word(&self, data: &[u8], offset: usize) -> Option<u32> {
        let raw = data.get(offset..offset + 4)?;
        let word = match self.opts.endian {
            Endian::Little => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            Endian::Big => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        };
        Some(word)
    }

    /// Try to anchor a stored-environment header in front of the block.
    ///
    /// The header checksum may itself contain printable bytes that parsed as
    /// the head of the first variable name, so the true data start is
    /// searched between the matched offset and the first `=`.
    fn refine_stored(
        &self,
        data: &[u8],
        block_start: usize,
        min_size: usize,
        end: usize,
        redundant: bool,
    ) -> Option<(usize, usize, u32)> {
        let header_len = if redundant { 5 } else { 4 };
        let eq = data[block_start..block_start + min_size]
            .iter()
            .position(|&b| b == b'=')?;

        for start in block_start..=block_start + eq {
            if start < header_len {
                continue;
            }
            let expected = self.header_word(data, start - header_len)?;
            if let Some(size) = self.declared_size(data, start, min_size, end, expected) {
                debug!(
                    "stored environment at offset {:#x}: declared size {:#x}",
                    start, size
                );
                return Some((start, size, expected));
            }
        }
        None
    }
}

impl Hunt for EnvMatcher {
    type Details = EnvDetails;
    const KIND: FindingKind = FindingKind::Environment;

    fn probe(&self, image: &Image, window: std::ops::Range<usize>) -> Probe<EnvDetails> {
        let data = image.bytes();
        let (block_end, count) = match parse_block(data, window.start, window.end) {
            Some(found) => found,
            None => return Probe::Miss,
        };
        if count < self.opts.min_entries {
            return Probe::Miss;
        }
        if self.opts.max_entries.is_some_and(|max| count > max) {
            return Probe::Miss;
        }

        let min_size = block_end - window.start;

        let candidates: &[bool] = match self.opts.redundant {
            Some(true) => &[true],
            Some(false) => &[false],
            None => &[true, false],
        };

        let mut stored = None;
        for &redundant in candidates {
            if let Some((start, size, crc)) =
                self.refine_stored(data, window.start, min_size, window.end, redundant)
            {
                stored = Some((start, size, crc, redundant));
                break;
            }
        }

        let (offset, size, checksum, flags, kind) = match stored {
            Some((start, size, crc, true)) => (
                start,
                size,
                Some(crc),
                Some(data[start - 1]),
                EnvKind::StoredRedundant,
            ),
            Some((start, size, crc, false)) => (start, size, Some(crc), None, EnvKind::Stored),
            None => (window.start, min_size, None, None, EnvKind::Builtin),
        };

        let region = &data[offset..offset + size];
        if let Some(needle) = &self.opts.contains {
            if memchr::memmem::find(region, needle.as_bytes()).is_none() {
                return Probe::Miss;
            }
        }

        Probe::Hit(Hit {
            offset,
            size,
            details: EnvDetails {
                kind,
                checksum,
                flags,
                entries: parse_entries(region),
            },
        })
    }
}

/// Maximum substitution passes before a reference cycle is assumed.
const EXPANSION_LIMIT: usize = 100;

/// Substitute `${name}` and `$name` references from `vars` into `value`,
/// repeating until a fixed point. Reference cycles terminate at the pass
/// limit with the partially-expanded text rather than looping.
pub fn expand_value(vars: &BTreeMap<String, String>, value: &str) -> String {
    let mut current = value.to_string();
    for _ in 0..EXPANSION_LIMIT {
        let next = substitute_once(vars, &current);
        if next == current {
            return current;
        }
        current = next;
    }
    warn!("variable expansion hit the pass limit; reference cycle in {value:?}");
    current
}

/// Expanded copy of an entire environment.
pub fn expand(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    vars.iter()
        .map(|(name, value)| (name.clone(), expand_value(vars, value)))
        .collect()
}

fn substitute_once(vars: &BTreeMap<String, String>, value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    let lookup = |name: &[u8]| {
        std::str::from_utf8(name)
            .ok()
            .and_then(|name| vars.get(name))
    };

    while i < bytes.len() {
        if bytes[i] != b'$' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        if bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = bytes[i + 2..].iter().position(|&b| b == b'}') {
                match lookup(&bytes[i + 2..i + 2 + close]) {
                    Some(replacement) => out.extend_from_slice(replacement.as_bytes()),
                    None => out.extend_from_slice(&bytes[i..i + close + 3]),
                }
                i += close + 3;
                continue;
            }
        } else {
            let name_len = bytes[i + 1..]
                .iter()
                .take_while(|&&b| b.is_ascii_alphanumeric() || b == b'_')
                .count();
            if name_len > 0 {
                match lookup(&bytes[i + 1..i + 1 + name_len]) {
                    Some(replacement) => out.extend_from_slice(replacement.as_bytes()),
                    None => out.extend_from_slice(&bytes[i..i + 1 + name_len]),
                }
                i += 1 + name_len;
                continue;
            }
        }

        out.push(b'$');
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
