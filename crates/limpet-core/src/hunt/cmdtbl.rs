//! Console command dispatch table matcher.
//!
//! Bootloader console commands live in linker-generated arrays of
//! fixed-stride records:
//!
//! ```text
//! {
//!     char *name;
//!     word  maxargs;
//!     word  repeat;          /* flag or function pointer, build-dependent */
//!     int (*handler)(...);
//!     char *usage;
//! #ifdef LONGHELP
//!     char *help;
//! #endif
//! #ifdef AUTOCOMPLETE
//!     int (*complete)(...);
//! #endif
//! }
//! ```
//!
//! The two optional fields may or may not be compiled in, so each candidate
//! offset is probed with all four present/absent combinations; the first
//! combination yielding `threshold` consecutive structurally valid records
//! wins and is reported back as the inferred build configuration.
//!
//! Finding one of these tables proves the image exposes a command console;
//! finding more than one usually means vendor code switches tables on some
//! authorization state, which is worth a close look.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::arch::Arch;
use crate::image::Image;

use super::{Finding, FindingKind, Hit, Hunt, Probe};

const NAME_MAX: usize = 64;
const TEXT_MAX: usize = 4096;

/// Cap on sub-table discovery probes for corrupt or adversarial images.
const WORKLIST_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CmdTableEntry {
    pub address: u64,
    pub name: String,
    pub maxargs: i64,
    pub repeat: u64,
    pub handler: u64,
    pub usage: String,
    pub help: Option<String>,
    pub complete: Option<u64>,
    /// Empty usage (and help, when present) marks sub-command entries.
    pub subcmd: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CmdTableDetails {
    pub entries: Vec<CmdTableEntry>,
    /// Inferred: records carry a long-help pointer.
    pub longhelp: bool,
    /// Inferred: records carry a completion-handler pointer.
    pub autocomplete: bool,
    pub is_subcmd_table: bool,
    /// True for tables reached through another table's handler pointer.
    pub nested: bool,
    /// Sub-tables discovered through handler pointers, when requested.
    pub sub_tables: Vec<Finding<CmdTableDetails>>,
}

#[derive(Debug, Clone)]
pub struct CmdTableOptions {
    /// Consecutive valid records required before a match is reported.
    pub threshold: usize,
    /// Validate that referenced addresses fall inside the image. Disable
    /// only for partial dumps, and expect false positives.
    pub check_pointers: bool,
    /// Known build configuration; `None` infers it per candidate.
    pub longhelp: Option<bool>,
    pub autocomplete: Option<bool>,
    /// Probe handler pointers for nested tables of the same shape.
    pub include_nested: bool,
    /// Only report tables defining this command.
    pub name: Option<String>,
}

impl Default for CmdTableOptions {
    fn default() -> Self {
        Self {
            threshold: 5,
            check_pointers: true,
            longhelp: None,
            autocomplete: None,
            include_nested: false,
            name: None,
        }
    }
}

pub struct CmdTableMatcher {
    arch: Arch,
    opts: CmdTableOptions,
}

/// Command names are lowercase alphanumerics with `_`/`-`, or the lone
/// `?` help alias.
fn is_command_name(name: &str) -> bool {
    if name == "?" {
        return true;
    }
    name.len() >= 2
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Help and usage text should be printable; printf-style specifiers mean we
/// wandered into format strings, a common false positive.
fn is_plausible_text(text: &[u8]) -> bool {
    text.iter()
        .all(|&b| (0x20..=0x7E).contains(&b) || b == b'\n' || b == b'\t' || b == b'\r')
}

fn has_format_spec(text: &[u8]) -> bool {
    let mut i = 0;
    while i < text.len() {
        if text[i] == b'%' {
            let mut j = i + 1;
            while j < text.len() && (text[j].is_ascii_digit() || text[j] == b'.' || text[j] == b'-')
            {
                j += 1;
            }
            if j < text.len() && text[j].is_ascii_lowercase() {
                return true;
            }
        }
        i += 1;
    }
    false
}

impl CmdTableMatcher {
    pub fn new(arch: Arch, opts: CmdTableOptions) -> Self {
        Self { arch, opts }
    }

    fn is_valid_ptr(&self, image: &Image, addr: u64, allow_null: bool) -> bool {
        if !self.opts.check_pointers {
            return true;
        }
        if addr == 0 {
            return allow_null;
        }
        image.contains_address(addr)
    }

    fn name_at(&self, image: &Image, ptr: u64) -> Option<String> {
        let offset = image.offset_of(ptr)?;
        let raw = image.cstr_at(offset, NAME_MAX)?;
        let name = std::str::from_utf8(raw).ok()?;
        if !is_command_name(name) || name.starts_with("unknown") {
            return None;
        }
        Some(name.to_string())
    }

    /// Dereference a usage/help pointer. `Some(None)` means a NULL pointer,
    /// which some commands legitimately leave unset.
    fn text_at(&self, image: &Image, ptr: u64) -> Option<Option<String>> {
        if ptr == 0 {
            return Some(None);
        }
        let offset = image.offset_of(ptr)?;
        let raw = image.cstr_at(offset, TEXT_MAX)?;
        if !is_plausible_text(raw) || has_format_spec(raw) {
            return None;
        }
        Some(Some(String::from_utf8_lossy(raw).into_owned()))
    }

    /// Decode one record at `offset`; `None` is a structural mismatch.
    fn record_at(
        &self,
        image: &Image,
        offset: usize,
        end: usize,
        longhelp: bool,
        autocomplete: bool,
    ) -> Option<CmdTableEntry> {
        let word = self.arch.word_size();
        let stride = self.stride(longhelp, autocomplete);
        if offset + stride > end {
            return None;
        }

        let read_word = |at: usize| self.arch.read_word(image.tail(at));
        let mut cursor = offset;

        let name_ptr = read_word(cursor)?;
        cursor += word;
        if !self.is_valid_ptr(image, name_ptr, false) {
            return None;
        }
        let name = self.name_at(image, name_ptr)?;

        let maxargs = self.arch.read_int(image.tail(cursor))?;
        cursor += word;

        // Older builds store a repeatable flag here, 2018+ builds a
        // function pointer. Neither is validated, matching that ambiguity.
        let repeat = read_word(cursor)?;
        cursor += word;

        let handler = read_word(cursor)?;
        cursor += word;
        if !self.is_valid_ptr(image, handler, false) {
            return None;
        }

        let usage_ptr = read_word(cursor)?;
        cursor += word;
        let usage = self.text_at(image, usage_ptr)?.unwrap_or_default();
        let mut subcmd = usage_ptr != 0 && usage.is_empty();

        let help = if longhelp {
            let help_ptr = read_word(cursor)?;
            cursor += word;
            let help = self.text_at(image, help_ptr)?;
            subcmd = match &help {
                Some(text) => usage.is_empty() && text.is_empty(),
                None => false,
            };
            Some(help.unwrap_or_default())
        } else {
            None
        };

        let complete = if autocomplete {
            let ptr = read_word(cursor)?;
            if !self.is_valid_ptr(image, ptr, true) {
                return None;
            }
            Some(ptr)
        } else {
            None
        };

        Some(CmdTableEntry {
            address: image.address_of(offset),
            name,
            maxargs,
            repeat,
            handler,
            usage,
            help,
            complete,
            subcmd,
        })
    }

    fn stride(&self, longhelp: bool, autocomplete: bool) -> usize {
        self.arch.word_size() * (5 + longhelp as usize + autocomplete as usize)
    }

    /// Collect consecutive valid records at `offset` for one field
    /// combination. `None` unless at least `threshold` records parse.
    fn table_at(
        &self,
        image: &Image,
        offset: usize,
        end: usize,
        longhelp: bool,
        autocomplete: bool,
    ) -> Option<(Vec<CmdTableEntry>, usize)> {
        let stride = self.stride(longhelp, autocomplete);
        let mut entries = Vec::new();
        let mut cursor = offset;

        while let Some(entry) = self.record_at(image, cursor, end, longhelp, autocomplete) {
            debug!(
                "candidate record at {:#x} ({}, {}) => {}",
                entry.address, longhelp, autocomplete, entry.name
            );
            entries.push(entry);
            cursor += stride;
        }

        if entries.len() < self.opts.threshold {
            return None;
        }
        let size = entries.len() * stride;
        Some((entries, size))
    }

    fn combinations(&self) -> Vec<(bool, bool)> {
        let longhelp = match self.opts.longhelp {
            Some(v) => vec![v],
            None => vec![true, false],
        };
        let autocomplete = match self.opts.autocomplete {
            Some(v) => vec![v],
            None => vec![true, false],
        };
        let mut combos = Vec::with_capacity(4);
        for &lh in &longhelp {
            for &ac in &autocomplete {
                combos.push((lh, ac));
            }
        }
        combos
    }

    fn match_table(&self, image: &Image, offset: usize, end: usize) -> Option<CmdTableDetails> {
        if !self.arch.is_word_aligned(image.address_of(offset)) {
            return None;
        }

        for (longhelp, autocomplete) in self.combinations() {
            let Some((entries, size)) = self.table_at(image, offset, end, longhelp, autocomplete)
            else {
                continue;
            };

            if let Some(wanted) = &self.opts.name {
                let defined = entries
                    .iter()
                    .any(|e| e.name.eq_ignore_ascii_case(wanted));
                if !defined {
                    continue;
                }
            }

            let is_subcmd_table = entries.iter().all(|e| e.subcmd);
            let mut details = CmdTableDetails {
                entries,
                longhelp,
                autocomplete,
                is_subcmd_table,
                nested: false,
                sub_tables: Vec::new(),
            };

            if self.opts.include_nested {
                let sub_tables = self.discover_sub_tables(image, offset, size, &details);
                details.sub_tables = sub_tables;
            }

            return Some(details);
        }
        None
    }

    /// Probe handler pointers for further tables of the same shape, using
    /// an explicit worklist rather than recursion so corrupted images
    /// cannot drive the stack.
    fn discover_sub_tables(
        &self,
        image: &Image,
        root_offset: usize,
        root_size: usize,
        root: &CmdTableDetails,
    ) -> Vec<Finding<CmdTableDetails>> {
        let mut found = Vec::new();
        let mut visited = BTreeSet::from([root_offset]);
        let mut work: VecDeque<u64> = root.entries.iter().map(|e| e.handler).collect();
        let mut probes = 0;

        while let Some(addr) = work.pop_front() {
            probes += 1;
            if probes > WORKLIST_MAX {
                debug!("sub-table worklist cap reached, stopping discovery");
                break;
            }

            let Some(offset) = image.offset_of(addr) else {
                continue;
            };
            if !visited.insert(offset) {
                continue;
            }
            // The root table's own span is not a sub-table of itself.
            if offset >= root_offset && offset < root_offset + root_size {
                continue;
            }

            // Sub-table shape must mirror the parent's build configuration.
            let Some((entries, size)) =
                self.table_at(image, offset, image.len(), root.longhelp, root.autocomplete)
            else {
                continue;
            };

            work.extend(entries.iter().map(|e| e.handler));
            let is_subcmd_table = entries.iter().all(|e| e.subcmd);
            found.push(Finding {
                kind: FindingKind::CommandTable,
                offset,
                address: image.address_of(offset),
                size,
                details: CmdTableDetails {
                    entries,
                    longhelp: root.longhelp,
                    autocomplete: root.autocomplete,
                    is_subcmd_table,
                    nested: true,
                    sub_tables: Vec::new(),
                },
            });
        }

        found.sort_by_key(|f| f.offset);
        found
    }
}

impl Hunt for CmdTableMatcher {
    type Details = CmdTableDetails;
    const KIND: FindingKind = FindingKind::CommandTable;

    fn probe(&self, image: &Image, window: std::ops::Range<usize>) -> Probe<CmdTableDetails> {
        match self.match_table(image, window.start, window.end) {
            Some(details) => {
                let stride = self.stride(details.longhelp, details.autocomplete);
                Probe::Hit(Hit {
                    offset: window.start,
                    size: details.entries.len() * stride,
                    details,
                })
            }
            None => Probe::Miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunt::{find, find_iter};

    const BASE: u64 = 0x8780_0000;

    /// Builder for synthetic 32-bit little-endian table images.
    struct TableImage {
        bytes: Vec<u8>,
    }

    impl TableImage {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0u8; len],
            }
        }

        fn put_str(&mut self, offset: usize, s: &str) -> u64 {
            self.bytes[offset..offset + s.len()].copy_from_slice(s.as_bytes());
            self.bytes[offset + s.len()] = 0;
            BASE + offset as u64
        }

        fn put_word(&mut self, offset: usize, value: u32) -> usize {
            self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            offset + 4
        }

        /// Write one record with longhelp present and autocomplete absent.
        fn put_record(&mut self, offset: usize, name: u64, handler: u64, usage: u64, help: u64) {
            let mut at = offset;
            at = self.put_word(at, name as u32);
            at = self.put_word(at, 3); // maxargs
            at = self.put_word(at, 1); // repeatable
            at = self.put_word(at, handler as u32);
            at = self.put_word(at, usage as u32);
            self.put_word(at, help as u32);
        }

        fn into_image(self) -> Image {
            Image::new(self.bytes, BASE).unwrap()
        }
    }

    const NAMES: [&str; 6] = ["bootm", "printenv", "setenv", "bootd", "reset", "help"];
    const TABLE_AT: usize = 0x400;
    const STRIDE: usize = 24; // 6 words of 4 bytes

    /// Six consecutive records at TABLE_AT, longhelp on, autocomplete off.
    fn six_entry_image() -> Image {
        let mut img = TableImage::new(0x1000);
        let usage = img.put_str(0x20, "do the thing");
        let help = img.put_str(0x40, "thing - does the thing");
        for (i, name) in NAMES.iter().enumerate() {
            let name_ptr = img.put_str(0x100 + i * 0x10, name);
            let handler = BASE + 0x800 + i as u64 * 4;
            img.put_record(TABLE_AT + i * STRIDE, name_ptr, handler, usage, help);
        }
        img.into_image()
    }

    fn matcher(opts: CmdTableOptions) -> CmdTableMatcher {
        CmdTableMatcher::new(Arch::Arm, opts)
    }

    #[test]
    fn test_threshold_met_and_flags_inferred() {
        let image = six_entry_image();
        let found = find(
            &matcher(CmdTableOptions::default()),
            &image,
            0,
            image.len(),
        )
        .unwrap()
        .expect("table should be found");

        assert_eq!(found.offset, TABLE_AT);
        assert_eq!(found.size, 6 * STRIDE);
        assert_eq!(found.details.entries.len(), 6);
        assert!(found.details.longhelp);
        assert!(!found.details.autocomplete);
        assert!(!found.details.is_subcmd_table);
        let names: Vec<&str> = found
            .details
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, NAMES);
    }

    #[test]
    fn test_threshold_not_met() {
        let image = six_entry_image();
        let opts = CmdTableOptions {
            threshold: 7,
            ..CmdTableOptions::default()
        };
        assert!(find(&matcher(opts), &image, 0, image.len())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_name_target_filter() {
        let image = six_entry_image();
        let opts = CmdTableOptions {
            name: Some("SETENV".into()),
            ..CmdTableOptions::default()
        };
        assert!(find(&matcher(opts), &image, 0, image.len())
            .unwrap()
            .is_some());

        let opts = CmdTableOptions {
            name: Some("tftpboot".into()),
            ..CmdTableOptions::default()
        };
        assert!(find(&matcher(opts), &image, 0, image.len())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_out_of_range_handler_rejects_record() {
        let mut img = TableImage::new(0x1000);
        let usage = img.put_str(0x20, "u");
        let help = img.put_str(0x40, "h");
        for (i, name) in NAMES.iter().enumerate() {
            let name_ptr = img.put_str(0x100 + i * 0x10, name);
            // Handlers point far outside the mapped range
            let handler = 0x1000_0000 + i as u64 * 4;
            img.put_record(TABLE_AT + i * STRIDE, name_ptr, handler, usage, help);
        }
        let image = img.into_image();
        assert!(
            find(&matcher(CmdTableOptions::default()), &image, 0, image.len())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_sub_table_discovery() {
        let mut img = TableImage::new(0x2000);
        let usage = img.put_str(0x20, "do the thing");
        let help = img.put_str(0x40, "thing - does the thing");

        // Nested table at 0x1400, reached through the root's first handler
        const SUB_AT: usize = 0x1400;
        for (i, name) in ["read", "write", "erase", "lock", "unlock"].iter().enumerate() {
            let name_ptr = img.put_str(0x1200 + i * 0x10, name);
            let handler = BASE + 0x1800 + i as u64 * 4;
            img.put_record(SUB_AT + i * STRIDE, name_ptr, handler, usage, help);
        }

        for (i, name) in NAMES.iter().enumerate() {
            let name_ptr = img.put_str(0x100 + i * 0x10, name);
            let handler = if i == 0 {
                BASE + SUB_AT as u64
            } else {
                BASE + 0x800 + i as u64 * 4
            };
            img.put_record(TABLE_AT + i * STRIDE, name_ptr, handler, usage, help);
        }
        let image = img.into_image();

        let opts = CmdTableOptions {
            include_nested: true,
            ..CmdTableOptions::default()
        };
        let found = find(&matcher(opts), &image, 0, image.len())
            .unwrap()
            .expect("root table");
        assert_eq!(found.offset, TABLE_AT);
        assert_eq!(found.details.sub_tables.len(), 1);

        let sub = &found.details.sub_tables[0];
        assert_eq!(sub.offset, SUB_AT);
        assert!(sub.details.nested);
        assert_eq!(sub.details.entries.len(), 5);

        // Filtered out by default
        let found = find(
            &matcher(CmdTableOptions::default()),
            &image,
            0,
            image.len(),
        )
        .unwrap()
        .expect("root table");
        assert!(found.details.sub_tables.is_empty());
    }

    #[test]
    fn test_results_do_not_overlap() {
        let image = six_entry_image();
        let results: Vec<_> = find_iter(
            &matcher(CmdTableOptions::default()),
            &image,
            0,
            image.len(),
        )
        .unwrap()
        .collect();
        for pair in results.windows(2) {
            assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
    }
}
