//! Archive level operations over MRF style tile archives.
//!
//! An archive is a data file of concatenated tiles plus an index of
//! big endian `(offset, length)` records, one per tile slot. The engines in
//! here copy, trim, join and stack archives without ever decoding a tile.
pub mod accessor;
pub mod archive;
pub mod compact;
pub mod dump;
pub mod error;
pub mod integrity;
pub mod join;
pub mod meta;
pub mod packed;
pub mod trim;
pub mod zstack;

#[cfg(test)]
mod testutil;

pub use archive::{ArchivePair, Naming, OutputGuard};
pub use compact::{compact_copy, CompactStats};
pub use error::{ArchiveError, Result};
pub use join::{join, JoinStats};
pub use trim::{trim_in_place, TrimOptions, TrimOutcome};
pub use zstack::{append_slices, ZStackStats};
