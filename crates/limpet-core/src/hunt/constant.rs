//! Exact byte-sequence matcher.
//!
//! Useful for file-format magics, checksum lookup tables, opcode sequences,
//! and for confirming that a region of raw material exists before pointing
//! the synthesizer at it.

use memchr::memmem;

use crate::image::Image;

use super::{FindingKind, Hit, Hunt, Probe};

pub struct ConstantMatcher {
    needle: Vec<u8>,
}

impl ConstantMatcher {
    pub fn new(needle: Vec<u8>) -> Self {
        Self { needle }
    }
}

impl Hunt for ConstantMatcher {
    type Details = ();
    const KIND: FindingKind = FindingKind::Constant;

    fn probe(&self, image: &Image, window: std::ops::Range<usize>) -> Probe<()> {
        if self.needle.is_empty() {
            return Probe::Exhausted;
        }
        match memmem::find(&image.bytes()[window.clone()], &self.needle) {
            Some(pos) => Probe::Hit(Hit {
                offset: window.start + pos,
                size: self.needle.len(),
                details: (),
            }),
            None => Probe::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunt::{find, find_iter};

    #[test]
    fn test_finds_all_occurrences() {
        let mut bytes = vec![0u8; 64];
        bytes[5..9].copy_from_slice(&[0xD0, 0x0D, 0xFE, 0xED]);
        bytes[40..44].copy_from_slice(&[0xD0, 0x0D, 0xFE, 0xED]);
        let image = Image::new(bytes, 0x100).unwrap();

        let matcher = ConstantMatcher::new(vec![0xD0, 0x0D, 0xFE, 0xED]);
        let offsets: Vec<usize> = find_iter(&matcher, &image, 0, image.len())
            .unwrap()
            .map(|f| f.offset)
            .collect();
        assert_eq!(offsets, vec![5, 40]);
    }

    #[test]
    fn test_absent_needle() {
        let image = Image::new(vec![0u8; 32], 0).unwrap();
        let matcher = ConstantMatcher::new(b"missing".to_vec());
        assert!(find(&matcher, &image, 0, image.len()).unwrap().is_none());
    }
}
