//! Read side tooling: index listings and raw tile extraction.
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use log::debug;

use mcore::block::BlockReader;
use mcore::record::RECORD_SIZE;
use mcore::Endian;

use crate::accessor;
use crate::archive::read_slot_from;
use crate::error::{ArchiveError, Result};

/// Write `index` as CSV, one row per record. Returns the number of rows.
pub fn dump_index<R: Read, W: Write>(index: R, order: Endian, out: &mut W) -> Result<u64> {
    writeln!(out, "idx_offset,data_offset,data_size")?;

    let mut rows = 0;
    for block in BlockReader::new(index, order) {
        let block = block?;
        let base = block.position;

        for (i, record) in block.records.iter().enumerate() {
            writeln!(
                out,
                "{},{},{}",
                base + (i * RECORD_SIZE) as u64,
                record.offset,
                record.length
            )?;
            rows += 1;
        }
    }
    out.flush()?;
    Ok(rows)
}

/// `size` bytes at `offset` of the file at `data`
pub fn read_range(data: &Path, offset: u64, size: u64) -> Result<Vec<u8>> {
    let mut file = File::open(data)?;
    accessor::read_range(&mut file, offset, size)
}

/// Content of tile `tile`, counting from 1, as located by `index`.
/// An empty slot reads as no bytes.
pub fn read_tile(data: &Path, index: &Path, tile: u64, order: Endian) -> Result<Vec<u8>> {
    let slot = tile
        .checked_sub(1)
        .ok_or_else(|| ArchiveError::InvalidRequest("tile numbers start at 1".to_string()))?;

    let record = read_slot_from(&mut BufReader::new(File::open(index)?), slot, order)?;
    debug!("tile {} is {:?}", tile, record);

    if record.is_empty() {
        return Ok(Vec::new());
    }
    read_range(data, record.offset, record.length)
}
