use std::fs::File;
use std::io::{copy, Read, Seek, SeekFrom, Write};
use std::path::Path;

use mcore::Record;

use crate::error::{ArchiveError, Result};

// Upper bound on what a record's length alone may reserve up front
const READ_RESERVE: u64 = 64 * 1024;

/// Read the bytes `record` points at
pub fn read_tile<R: Read + Seek>(data: &mut R, record: &Record) -> Result<Vec<u8>> {
    read_range(data, record.offset, record.length)
}

pub fn read_range<R: Read + Seek>(data: &mut R, offset: u64, length: u64) -> Result<Vec<u8>> {
    data.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::with_capacity(length.min(READ_RESERVE) as usize);
    data.take(length).read_to_end(&mut buf)?;

    if (buf.len() as u64) < length {
        return Err(ArchiveError::TruncatedRead {
            offset,
            expected: length,
            actual: buf.len() as u64,
        });
    }
    Ok(buf)
}

/// Stream the tile at `record` from `src` into `dst` without buffering it whole
pub fn copy_tile<R: Read + Seek, W: Write>(src: &mut R, record: &Record, dst: &mut W) -> Result<u64> {
    src.seek(SeekFrom::Start(record.offset))?;

    let copied = copy(&mut src.take(record.length), dst)?;
    if copied < record.length {
        return Err(ArchiveError::TruncatedRead {
            offset: record.offset,
            expected: record.length,
            actual: copied,
        });
    }
    Ok(copied)
}

/// Write `bytes` at the append cursor, returns the advanced cursor
pub fn append_tile<W: Write>(data: &mut W, cursor: u64, bytes: &[u8]) -> Result<u64> {
    data.write_all(bytes)?;
    Ok(cursor + bytes.len() as u64)
}

/// Append the whole of `src` to `dst`, returns the number of bytes appended
pub fn append_file(src: &Path, dst: &mut File) -> Result<u64> {
    let mut input = File::open(src)?;

    dst.seek(SeekFrom::End(0))?;
    let appended = copy(&mut input, dst)?;
    Ok(appended)
}
