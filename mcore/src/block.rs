use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use crate::record::{decode_block, encode_block, is_all_empty};
use crate::record::{CodecError, Endian, Record, BLOCK_SIZE, RECORD_SIZE};

/// Fill `buf` from `reader`, stopping short only at end of stream.
///
/// Returns the number of bytes read, a short count means EOF was reached.
pub fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(x) => filled += x,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One block worth of records and where it sits in the index
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Byte position of the first record in the index
    pub position: u64,
    pub records: Vec<Record>,
}

impl Block {
    pub fn byte_len(&self) -> usize {
        self.records.len() * RECORD_SIZE
    }

    pub fn first_slot(&self) -> u64 {
        self.position / RECORD_SIZE as u64
    }

    pub fn is_empty(&self) -> bool {
        is_all_empty(&self.records)
    }
}

/// Streams an index a block at a time.
///
/// The trailing block may be short, it is returned as is. A trailing
/// fragment that is not a whole number of records is an error.
pub struct BlockReader<R: Read> {
    inner: R,
    order: Endian,
    position: u64,
    done: bool,
    buf: [u8; BLOCK_SIZE],
}

impl<R: Read> BlockReader<R> {
    pub fn new(reader: R, order: Endian) -> Self {
        BlockReader {
            inner: reader,
            order,
            position: 0,
            done: false,
            buf: [0u8; BLOCK_SIZE],
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_block(&mut self) -> Result<Option<Block>, CodecError> {
        if self.done {
            return Ok(None);
        }

        let len = fill_block(&mut self.inner, &mut self.buf)?;
        if len < BLOCK_SIZE {
            self.done = true;
        }
        if len == 0 {
            return Ok(None);
        }
        if len % RECORD_SIZE != 0 {
            return Err(CodecError::MalformedIndex {
                len: self.position + len as u64,
            });
        }

        let block = Block {
            position: self.position,
            records: decode_block(&self.buf[..len], self.order)?,
        };
        self.position += len as u64;

        Ok(Some(block))
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = Result<Block, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_block().transpose()
    }
}

/// Writes an index a block at a time, skipping all empty blocks.
///
/// Skipped blocks are seeked over so the filesystem can leave a hole. The
/// caller must size the file to [`BlockWriter::finish`]'s length since a
/// trailing skip does not extend the file.
pub struct BlockWriter<W: Write + Seek> {
    inner: W,
    order: Endian,
    position: u64,
    skipped: u64,
}

impl<W: Write + Seek> BlockWriter<W> {
    pub fn new(writer: W, order: Endian) -> Self {
        BlockWriter {
            inner: writer,
            order,
            position: 0,
            skipped: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of blocks left as holes
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn write_block(&mut self, records: &[Record]) -> std::io::Result<()> {
        if is_all_empty(records) {
            return self.skip((records.len() * RECORD_SIZE) as u64);
        }

        self.inner.write_all(&encode_block(records, self.order))?;
        self.position += (records.len() * RECORD_SIZE) as u64;
        Ok(())
    }

    pub fn skip(&mut self, len: u64) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Current(len as i64))?;
        self.position += len;
        self.skipped += 1;
        Ok(())
    }

    /// Writes `records` in block sized pieces
    pub fn write_all_records(&mut self, records: &[Record]) -> std::io::Result<()> {
        for block in records.chunks(BLOCK_SIZE / RECORD_SIZE) {
            self.write_block(block)?;
        }
        Ok(())
    }

    /// Flushes and returns the logical index length
    pub fn finish(mut self) -> std::io::Result<u64> {
        self.inner.flush()?;
        Ok(self.position)
    }
}
