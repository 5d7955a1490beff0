//! Packed index format.
//!
//! A packed index stores only the 512 byte blocks of an index that hold any
//! non-zero byte, preceded by a header mapping which blocks are present.
//!
//! ```text
//! reserved line:  "IDX\0" | records:u64 | header lines:u32
//! bitmap line:    count:u32 | bits 0-31:u32 | bits 32-63:u32 | bits 64-95:u32
//! ```
//!
//! All header fields are big endian. There is one bitmap line per 96 input
//! blocks, `count` being the number of set bits in all previous lines. The
//! header line count includes the reserved line. A trailing partial block is
//! stored with its own length.
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use mcore::record::{is_zero_block, BLOCK_SIZE, RECORD_SIZE};
use mcore::{Endian, Record};

use crate::error::{ArchiveError, Result};

const SIGNATURE: &[u8; 4] = b"IDX\0";
const LINE_SIZE: u64 = 16;
const BLOCKS_PER_LINE: u64 = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    records: u64,
    lines: Vec<[u32; 4]>,
}

impl Header {
    fn new(records: u64) -> Self {
        let blocks = div_up(records * RECORD_SIZE as u64, BLOCK_SIZE as u64);
        Header {
            records,
            lines: vec![[0; 4]; div_up(blocks, BLOCKS_PER_LINE) as usize],
        }
    }

    fn index_len(&self) -> u64 {
        self.records * RECORD_SIZE as u64
    }

    fn blocks(&self) -> u64 {
        div_up(self.index_len(), BLOCK_SIZE as u64)
    }

    /// Bytes in the header, reserved line included
    fn len(&self) -> u64 {
        LINE_SIZE * (1 + self.lines.len() as u64)
    }

    /// Length of block `block` in the unpacked index
    fn block_len(&self, block: u64) -> u64 {
        (self.index_len() - block * BLOCK_SIZE as u64).min(BLOCK_SIZE as u64)
    }

    fn set(&mut self, block: u64) {
        let (line, bit) = split(block);
        self.lines[line][1 + bit / 32] |= 1 << (bit % 32);
    }

    fn is_set(&self, block: u64) -> bool {
        let (line, bit) = split(block);
        self.lines[line][1 + bit / 32] & (1 << (bit % 32)) != 0
    }

    /// Number of present blocks stored before `block`
    fn rank(&self, block: u64) -> u64 {
        let (line, bit) = split(block);
        let words = &self.lines[line];

        let mut rank = words[0] as u64;
        for word in words[1..1 + bit / 32].iter() {
            rank += word.count_ones() as u64;
        }
        rank + (words[1 + bit / 32] & ((1u32 << (bit % 32)) - 1)).count_ones() as u64
    }

    fn fill_counts(&mut self) {
        let mut count = 0u32;
        for line in self.lines.iter_mut() {
            line[0] = count;
            count += line[1..].iter().map(|w| w.count_ones()).sum::<u32>();
        }
    }

    fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(SIGNATURE)?;
        out.write_u64::<BigEndian>(self.records)?;
        out.write_u32::<BigEndian>(1 + self.lines.len() as u32)?;

        for line in self.lines.iter() {
            for word in line.iter() {
                out.write_u32::<BigEndian>(*word)?;
            }
        }
        Ok(())
    }

    fn read<R: Read>(input: &mut R) -> Result<Header> {
        let mut sig = [0u8; 4];
        input.read_exact(&mut sig)?;
        if &sig != SIGNATURE {
            return Err(ArchiveError::PackedIndex("bad signature".to_string()));
        }

        let records = input.read_u64::<BigEndian>()?;
        let line_count = input.read_u32::<BigEndian>()? as u64;

        let expected = records
            .checked_mul(RECORD_SIZE as u64)
            .map(|len| div_up(div_up(len, BLOCK_SIZE as u64), BLOCKS_PER_LINE))
            .ok_or_else(|| ArchiveError::PackedIndex(format!("{} records is too many", records)))?;
        if line_count != 1 + expected {
            return Err(ArchiveError::PackedIndex(format!(
                "{} header lines for {} records, expected {}",
                line_count,
                records,
                1 + expected
            )));
        }

        // Grown as lines arrive, a damaged count must not size the allocation
        let mut header = Header {
            records,
            lines: Vec::new(),
        };
        let mut count = 0u64;
        for i in 0..expected {
            let mut line = [0u32; 4];
            input.read_u32_into::<BigEndian>(&mut line).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => {
                    ArchiveError::PackedIndex(format!("header ends before line {} of {}", i + 2, line_count))
                }
                _ => e.into(),
            })?;

            if line[0] as u64 != count {
                return Err(ArchiveError::PackedIndex(format!(
                    "line {} counts {} blocks before it, bitmap has {}",
                    i + 1,
                    line[0],
                    count
                )));
            }
            count += line[1..].iter().map(|w| w.count_ones() as u64).sum::<u64>();
            header.lines.push(line);
        }

        // Bits past the last block must stay clear
        let blocks = header.blocks();
        if let Some(last) = header.lines.last() {
            let used = (blocks - 1) % BLOCKS_PER_LINE + 1;
            for bit in used..BLOCKS_PER_LINE {
                let bit = bit as usize;
                if last[1 + bit / 32] & (1 << (bit % 32)) != 0 {
                    return Err(ArchiveError::PackedIndex(format!(
                        "bit {} set past the last block",
                        bit
                    )));
                }
            }
        }
        Ok(header)
    }
}

fn div_up(x: u64, y: u64) -> u64 {
    x / y + u64::from(x % y != 0)
}

fn split(block: u64) -> (usize, usize) {
    ((block / BLOCKS_PER_LINE) as usize, (block % BLOCKS_PER_LINE) as usize)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackStats {
    pub index_len: u64,
    pub packed_len: u64,
    pub blocks_kept: u64,
}

/// Pack the `index_len` byte index read from `input` into `out`
pub fn pack<R: Read, W: Write + Seek>(input: &mut R, index_len: u64, out: &mut W) -> Result<PackStats> {
    if index_len % RECORD_SIZE as u64 != 0 {
        return Err(ArchiveError::MalformedIndex { len: index_len });
    }

    let mut header = Header::new(index_len / RECORD_SIZE as u64);
    debug!("packed header is {} bytes", header.len());

    // Header goes in last, once the bitmap is known
    out.seek(SeekFrom::Start(header.len()))?;

    let mut buf = [0u8; BLOCK_SIZE];
    let mut stats = PackStats {
        index_len,
        packed_len: header.len(),
        blocks_kept: 0,
    };

    for block in 0..header.blocks() {
        let len = header.block_len(block) as usize;
        input.read_exact(&mut buf[..len])?;

        if is_zero_block(&buf[..len]) {
            continue;
        }
        out.write_all(&buf[..len])?;
        header.set(block);
        stats.blocks_kept += 1;
        stats.packed_len += len as u64;
    }

    header.fill_counts();
    out.seek(SeekFrom::Start(0))?;
    header.write(out)?;
    out.flush()?;

    info!(
        "packed index from {} to {} bytes, {} of {} blocks kept",
        stats.index_len,
        stats.packed_len,
        stats.blocks_kept,
        header.blocks()
    );
    Ok(stats)
}

/// Restore the index packed in `input` into `out`, absent blocks become holes.
///
/// Returns the unpacked length. A trailing hole does not extend `out`, the
/// caller sizes it.
pub fn unpack<R: Read, W: Write + Seek>(input: &mut R, out: &mut W) -> Result<u64> {
    let header = Header::read(input)?;
    let mut buf = [0u8; BLOCK_SIZE];

    out.seek(SeekFrom::Start(0))?;
    for block in 0..header.blocks() {
        let len = header.block_len(block) as usize;

        if header.is_set(block) {
            input.read_exact(&mut buf[..len])?;
            out.write_all(&buf[..len])?;
        } else {
            out.seek(SeekFrom::Current(len as i64))?;
        }
    }
    out.flush()?;

    debug!("unpacked {} records", header.records);
    Ok(header.index_len())
}

/// Random access to the records of a packed index
#[derive(Debug)]
pub struct PackedIndex<R: Read + Seek> {
    inner: R,
    header: Header,
}

impl<R: Read + Seek> PackedIndex<R> {
    pub fn open(mut inner: R) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut inner)?;
        Ok(PackedIndex { inner, header })
    }

    /// Records in the unpacked index
    pub fn len(&self) -> u64 {
        self.header.records
    }

    pub fn is_empty(&self) -> bool {
        self.header.records == 0
    }

    pub fn record(&mut self, slot: u64) -> Result<Record> {
        if slot >= self.header.records {
            return Err(ArchiveError::InvalidRequest(format!(
                "slot {} is past the end of the index",
                slot
            )));
        }

        let byte = slot * RECORD_SIZE as u64;
        let block = byte / BLOCK_SIZE as u64;
        if !self.header.is_set(block) {
            return Ok(Record::EMPTY);
        }

        let position =
            self.header.len() + self.header.rank(block) * BLOCK_SIZE as u64 + byte % BLOCK_SIZE as u64;
        let mut buf = [0u8; RECORD_SIZE];
        self.inner.seek(SeekFrom::Start(position))?;
        self.inner.read_exact(&mut buf)?;
        Ok(Record::decode(&buf, Endian::Big))
    }
}
