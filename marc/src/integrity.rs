use log::debug;

use mcore::Record;

use crate::error::{ArchiveError, Result};

/// Check that the live tiles of an index fit a data file of `data_len` bytes
/// and never share bytes. Zero-length records that still carry an offset are
/// rejected as well.
///
/// With `data_len` of `None` only the overlap and dangling checks run.
pub fn check_layout(records: &[Record], data_len: Option<u64>) -> Result<()> {
    let mut live = Vec::with_capacity(records.len());

    for (slot, record) in records.iter().enumerate() {
        if record.is_dangling() {
            return Err(ArchiveError::CorruptArchive(format!(
                "slot {} has offset {} but no length",
                slot, record.offset
            )));
        }
        if record.is_empty() {
            continue;
        }

        let end = record.end().ok_or_else(|| {
            ArchiveError::CorruptArchive(format!("slot {} overflows the address space", slot))
        })?;

        if let Some(len) = data_len {
            if end > len {
                return Err(ArchiveError::CorruptArchive(format!(
                    "slot {} ends at {}, past the data end {}",
                    slot, end, len
                )));
            }
        }
        live.push((record.offset, end, slot));
    }

    live.sort_unstable();
    for pair in live.windows(2) {
        let (_, prev_end, prev_slot) = pair[0];
        let (start, _, slot) = pair[1];

        if start < prev_end {
            return Err(ArchiveError::CorruptArchive(format!(
                "slots {} and {} overlap at offset {}",
                prev_slot, slot, start
            )));
        }
    }

    debug!("layout ok, {} live tiles", live.len());
    Ok(())
}

#[cfg(test)]
mod test_integrity {
    use super::*;

    fn corrupt(records: &[Record], data_len: Option<u64>) -> bool {
        matches!(
            check_layout(records, data_len),
            Err(ArchiveError::CorruptArchive(_))
        )
    }

    #[test]
    fn clean_layout() {
        let recs = [Record::new(10, 5), Record::EMPTY, Record::new(0, 10), Record::new(15, 1)];
        check_layout(&recs, Some(16)).unwrap();
        check_layout(&[], Some(0)).unwrap();
    }

    #[test]
    fn overlap() {
        assert!(corrupt(&[Record::new(0, 10), Record::new(9, 2)], None));
        assert!(corrupt(&[Record::new(4, 2), Record::new(4, 2)], None));
    }

    #[test]
    fn past_end() {
        assert!(corrupt(&[Record::new(0, 10)], Some(9)));
        assert!(!corrupt(&[Record::new(0, 10)], None));
    }

    #[test]
    fn dangling() {
        assert!(corrupt(&[Record::new(3, 0)], Some(100)));
    }

    #[test]
    fn overflow() {
        assert!(corrupt(&[Record::new(u64::MAX, 2)], None));
    }
}
