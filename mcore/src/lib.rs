//! Core primitives of a tiled raster archive index.
//!
//! An index file is a flat run of 16 byte records, one per tile slot. Each
//! record is an `(offset, length)` pair of big endian `u64` pointing into the
//! companion data file. A `(0, 0)` record marks an empty slot.
//!
//! Indexes are processed in [`record::BLOCK_SIZE`] byte blocks, see
//! [`block::BlockReader`] and [`block::BlockWriter`].
pub mod block;
pub mod record;

pub use record::CodecError;
pub use record::Endian;
pub use record::Record;
