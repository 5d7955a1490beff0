use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

/// Size of one on-disk record, `offset:u64 || length:u64`
pub const RECORD_SIZE: usize = 16;

/// Index processing granularity, 32 records
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_RECORDS: usize = BLOCK_SIZE / RECORD_SIZE;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error("index length {len} is not a multiple of {RECORD_SIZE}")]
    MalformedIndex { len: u64 },
}

/// Byte order of the records in an index buffer.
///
/// Archives are always big endian, little endian is only accepted by the
/// read tooling for indexes produced by foreign writers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

impl Endian {
    fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Big => BigEndian::read_u64(buf),
            Endian::Little => LittleEndian::read_u64(buf),
        }
    }

    fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endian::Big => BigEndian::write_u64(buf, value),
            Endian::Little => LittleEndian::write_u64(buf, value),
        }
    }
}

/// One tile slot.
///
/// `length == 0` is an empty slot, by convention its offset is 0 as well.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    pub offset: u64,
    pub length: u64,
}

impl Record {
    pub const EMPTY: Record = Record { offset: 0, length: 0 };

    pub fn new(offset: u64, length: u64) -> Self {
        Record { offset, length }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// A zero length record that still carries an offset
    pub fn is_dangling(&self) -> bool {
        self.length == 0 && self.offset != 0
    }

    /// One past the last byte of the tile
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn decode(buf: &[u8], order: Endian) -> Self {
        Record {
            offset: order.read_u64(&buf[..8]),
            length: order.read_u64(&buf[8..RECORD_SIZE]),
        }
    }

    pub fn encode(&self, order: Endian) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        order.write_u64(&mut buf[..8], self.offset);
        order.write_u64(&mut buf[8..], self.length);
        buf
    }
}

pub fn decode_block(bytes: &[u8], order: Endian) -> Result<Vec<Record>, CodecError> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(CodecError::MalformedIndex {
            len: bytes.len() as u64,
        });
    }

    Ok(bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| Record::decode(chunk, order))
        .collect())
}

pub fn encode_block(records: &[Record], order: Endian) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
    for record in records {
        buf.extend_from_slice(&record.encode(order));
    }
    buf
}

pub fn is_all_empty(records: &[Record]) -> bool {
    records.iter().all(Record::is_empty)
}

/// Raw check, used where a block is skipped without decoding it
pub fn is_zero_block(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod test_record {
    use super::*;

    #[test]
    fn big_endian_on_disk() {
        let rec = Record::new(0x0102_0304_0506_0708, 0x10);

        assert_eq!(
            rec.encode(Endian::Big),
            [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0x10]
        );
    }

    #[test]
    fn little_endian_on_disk() {
        let rec = Record::new(1000, 2000);
        let bytes = rec.encode(Endian::Little);

        assert_eq!(&bytes[..8], &1000u64.to_le_bytes());
        assert_eq!(&bytes[8..], &2000u64.to_le_bytes());
    }

    #[test]
    fn decode_matches_host_independent_value() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&350u64.to_be_bytes());
        bytes.extend_from_slice(&12345u64.to_be_bytes());

        assert_eq!(
            decode_block(&bytes, Endian::Big).unwrap(),
            vec![Record::new(350, 12345)]
        );
    }

    #[test]
    fn decode_wrong_order_is_garbage_not_error() {
        let bytes = Record::new(1, 2).encode(Endian::Big);
        let rec = decode_block(&bytes, Endian::Little).unwrap();

        assert_eq!(rec[0], Record::new(1 << 56, 2 << 56));
    }

    #[test]
    fn decode_rejects_partial_record() {
        let bytes = [0u8; RECORD_SIZE + 3];

        match decode_block(&bytes, Endian::Big) {
            Err(CodecError::MalformedIndex { len }) => assert_eq!(len, 19),
            x => panic!("unexpected: {:?}", x),
        }
    }

    #[test]
    fn decode_empty_buffer() {
        assert!(decode_block(&[], Endian::Big).unwrap().is_empty());
    }

    #[test]
    fn encode_block_layout() {
        let recs = vec![Record::new(0, 10), Record::EMPTY, Record::new(10, 20)];
        let bytes = encode_block(&recs, Endian::Big);

        assert_eq!(bytes.len(), 3 * RECORD_SIZE);
        assert!(is_zero_block(&bytes[RECORD_SIZE..2 * RECORD_SIZE]));
        assert_eq!(decode_block(&bytes, Endian::Big).unwrap(), recs);
    }

    #[test]
    fn all_empty_ignores_dangling_offset() {
        let recs = vec![Record::EMPTY, Record::new(77, 0)];

        assert!(is_all_empty(&recs));
        assert!(!is_zero_block(&encode_block(&recs, Endian::Big)));
        assert!(recs[1].is_dangling());
    }

    #[test]
    fn not_all_empty() {
        let recs = vec![Record::EMPTY, Record::new(0, 1)];
        assert!(!is_all_empty(&recs));
    }

    #[test]
    fn end_overflow() {
        assert_eq!(Record::new(u64::MAX, 1).end(), None);
        assert_eq!(Record::new(5, 10).end(), Some(15));
    }
}
