use thiserror::Error;

/// Fatal error conditions surfaced by the core.
///
/// Structural mismatches encountered while probing a buffer are *not* errors:
/// false-positive candidates are expected during a scan and are rejected
/// silently by the matchers. Everything that reaches this enum is a problem
/// the caller must act on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid search range [{start:#x}, {end:#x}) for a {len} byte image")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("exclusion gap at {addr:#x} overlaps another gap or exceeds the image")]
    GapRejected { addr: u64 },

    #[error("image of {len} bytes at base {base:#x} wraps the address space")]
    ImageOverflow { base: u64, len: usize },

    #[error("memory patch at {addr:#x} carries no bytes")]
    EmptyPatch { addr: u64 },

    #[error("memory patch at {addr:#x} ({len} bytes) wraps the address space")]
    AddressOverflow { addr: u64, len: usize },

    #[error("patch destination {a:#x} overlaps patch destination {b:#x}")]
    PatchOverlap { a: u64, b: u64 },

    #[error(
        "no source window checksums to {target:#010x} \
         (chunk {chunk_index}, destination {dest:#x}); \
         consider raising the maximum source length"
    )]
    ChunkUnresolvable {
        chunk_index: usize,
        dest: u64,
        target: u32,
    },

    #[error(
        "write to {writer:#x} clobbers source bytes at {reader:#x} \
         and no operation ordering avoids it"
    )]
    DependencyConflict { writer: u64, reader: u64 },

    #[error("synthesis cancelled after {resolved} of {total} chunks")]
    Cancelled { resolved: usize, total: usize },

    #[error("stratagem declares checksum parameters this engine does not implement")]
    ChecksumSpecUnsupported,

    #[error("operation {index}: expected checksum {expected:#010x}, computed {actual:#010x}")]
    ReplayMismatch {
        index: usize,
        expected: u32,
        actual: u32,
    },

    #[error("address {addr:#x} ({len} bytes) is outside simulated memory")]
    UnmappedAddress { addr: u64, len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = Error::ChunkUnresolvable {
            chunk_index: 3,
            dest: 0x8780_000c,
            target: 0xdead_beef,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("chunk 3"));
        assert!(msg.contains("0x8780000c"));
    }
}
