//! Bounded-window structure searches over an [`Image`].
//!
//! Every concrete matcher supplies a single primitive, [`Hunt::probe`]: given
//! a window, either confirm a structure (possibly after a self-contained
//! scan), deny one at the window's first offset, or declare the rest of the
//! window empty. The generic driver in this module owns the offset
//! bookkeeping: it advances past confirmed matches by their reported size,
//! past misses by one byte, and skips exclusion gaps, so matchers never
//! reimplement any of it.

pub mod cmdtbl;
pub mod constant;
pub mod env;
pub mod fdt;

use serde::Serialize;
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::Image;

/// Closed set of structure kinds the matchers can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    CommandTable,
    Environment,
    DeviceTree,
    Constant,
}

/// One confirmed structure.
///
/// `offset` is image-relative, `address` is the corresponding target
/// address. `details` carries the kind-specific fields and is plain data,
/// suitable for direct serialization into a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding<D> {
    pub kind: FindingKind,
    pub offset: usize,
    pub address: u64,
    pub size: usize,
    pub details: D,
}

/// A confirmed match returned by a probe.
///
/// `offset` may be greater than the probed window start when the matcher
/// performed its own bounded scan (e.g. a magic-number search).
#[derive(Debug)]
pub struct Hit<D> {
    pub offset: usize,
    pub size: usize,
    pub details: D,
}

/// Outcome of probing a window.
#[derive(Debug)]
pub enum Probe<D> {
    Hit(Hit<D>),
    /// Nothing anchored at the window's first offset; the driver advances
    /// by one byte. Malformed candidate structures land here silently.
    Miss,
    /// The matcher scanned the whole window itself and found nothing; the
    /// driver stops immediately.
    Exhausted,
}

/// A concrete structure matcher.
pub trait Hunt {
    type Details;

    const KIND: FindingKind;

    /// Probe `window.start`, or scan `window` when the matcher can do so
    /// more cheaply than byte-at-a-time driving.
    fn probe(&self, image: &Image, window: std::ops::Range<usize>) -> Probe<Self::Details>;
}

fn validate_window(image: &Image, start: usize, end: usize) -> Result<()> {
    if start > end || end > image.len() {
        return Err(Error::InvalidRange {
            start,
            end,
            len: image.len(),
        });
    }
    Ok(())
}

/// First match in `[start, end)`, or `None`.
pub fn find<M: Hunt>(
    matcher: &M,
    image: &Image,
    start: usize,
    end: usize,
) -> Result<Option<Finding<M::Details>>> {
    Ok(find_iter(matcher, image, start, end)?.next())
}

/// Lazy iterator over all matches in `[start, end)`, in ascending offset
/// order. A fresh call re-scans from `start`. Results of one kind never
/// overlap: the driver always advances past a match before probing again.
pub fn find_iter<'a, M: Hunt>(
    matcher: &'a M,
    image: &'a Image,
    start: usize,
    end: usize,
) -> Result<FindIter<'a, M>> {
    validate_window(image, start, end)?;
    Ok(FindIter {
        matcher,
        image,
        cursor: start,
        end,
    })
}

pub struct FindIter<'a, M: Hunt> {
    matcher: &'a M,
    image: &'a Image,
    cursor: usize,
    end: usize,
}

impl<M: Hunt> Iterator for FindIter<'_, M> {
    type Item = Finding<M::Details>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.end {
            if let Some(gap_end) = self.image.gap_end(self.cursor) {
                self.cursor = gap_end;
                continue;
            }

            match self.matcher.probe(self.image, self.cursor..self.end) {
                Probe::Hit(hit) => {
                    if self.image.range_touches_gap(hit.offset, hit.size) {
                        self.cursor = hit.offset + 1;
                        continue;
                    }

                    debug!(
                        "{} match at {:#x} ({} bytes)",
                        M::KIND,
                        self.image.address_of(hit.offset),
                        hit.size
                    );

                    // A zero-size hit must still advance the cursor.
                    self.cursor = hit.offset + hit.size.max(1);
                    return Some(Finding {
                        kind: M::KIND,
                        offset: hit.offset,
                        address: self.image.address_of(hit.offset),
                        size: hit.size,
                        details: hit.details,
                    });
                }
                Probe::Miss => self.cursor += 1,
                Probe::Exhausted => self.cursor = self.end,
            }
        }
        None
    }
}
