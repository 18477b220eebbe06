//! # limpet-core
//!
//! Core library for the limpet bootloader exploitation toolkit.
//!
//! This crate provides:
//! - A table-driven CRC32 engine with O(1) incremental extension
//! - Structure searches over memory/flash dumps (command dispatch tables,
//!   stored environments, device trees, raw byte patterns)
//! - Checksum-inversion synthesis: planning a sequence of checksum-write
//!   operations that deposits a chosen payload at a chosen address
//! - Serializable operation plans ("stratagems") and an offline replay
//!   simulator for verifying them without a live target
//!
//! Live-console transport is deliberately out of scope: the core operates
//! on fully loaded, immutable images and produces plans for an external
//! executor to carry out.

pub mod arch;
pub mod cancel;
pub mod checksum;
pub mod error;
pub mod hunt;
pub mod image;
pub mod patch;
pub mod stratagem;

#[cfg(test)]
pub(crate) mod testutil;

pub use arch::{Arch, Endian};
pub use cancel::CancelToken;
pub use checksum::{Crc32, crc32};
pub use error::{Error, Result};
pub use hunt::{
    Finding, FindingKind, Hunt, find, find_iter,
    cmdtbl::{CmdTableDetails, CmdTableEntry, CmdTableMatcher, CmdTableOptions},
    constant::ConstantMatcher,
    env::{EnvDetails, EnvKind, EnvMatcher, EnvOptions, expand, expand_value},
    fdt::{FdtDetails, FdtMatcher},
};
pub use image::Image;
pub use patch::{MemoryPatch, PatchList};
pub use stratagem::{
    ChecksumSpec, ExcludedTail, Operation, Stratagem, load_stratagem,
    replay::Simulator,
    save_stratagem,
    synth::{SynthConfig, Synthesizer, TailPolicy, WRITE_WIDTH},
};
