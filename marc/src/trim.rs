//! In-place trimming of an archive.
//!
//! Unlike [`crate::compact::compact_copy`] no second copy of the data is made,
//! tiles are slid down inside the data file itself. The run is not atomic: a
//! crash while tiles are moving leaves an index pointing at moved bytes. No
//! reader may open the archive while a trim runs.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

use log::{debug, info, warn};
use serde::Deserialize;
use tempfile::NamedTempFile;

use mcore::block::BlockWriter;
use mcore::record::encode_block;
use mcore::{Endian, Record};

use crate::accessor::read_tile;
use crate::archive::{copy_permissions, scratch_dir, ArchivePair};
use crate::error::{ArchiveError, Result};
use crate::integrity::check_layout;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrimOptions {
    /// Leading bytes of the data file that are never touched
    #[serde(skip)]
    pub start_offset: u64,

    /// Stage the rewritten index in a temporary file and rename it over the
    /// old one, instead of overwriting the index in place
    pub shadow_index: bool,

    /// Reject overlapping or dangling records before anything is moved
    pub verify: bool,
}

impl Default for TrimOptions {
    fn default() -> Self {
        TrimOptions {
            start_offset: 0,
            shadow_index: true,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimOutcome {
    AlreadyPacked { data_len: u64 },
    Trimmed { old_len: u64, new_len: u64, moved: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Move {
    slot: usize,
    from: u64,
    to: u64,
    length: u64,
}

/// Where every live tile goes, computed before a single byte is written
#[derive(Debug)]
struct Plan {
    moves: Vec<Move>,
    records: Vec<Record>,
    final_len: u64,
}

fn plan(records: &[Record], data_len: u64, start_offset: u64) -> Result<Option<Plan>> {
    let mut live: Vec<(u64, u64, usize)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_empty())
        .map(|(slot, r)| (r.offset, r.length, slot))
        .collect();

    let needed = live
        .iter()
        .try_fold(start_offset, |acc, (_, len, _)| acc.checked_add(*len))
        .ok_or_else(|| ArchiveError::CorruptArchive("tile lengths overflow".to_string()))?;

    if needed > data_len {
        return Err(ArchiveError::CorruptArchive(format!(
            "index claims {} bytes, data file has {}",
            needed, data_len
        )));
    }
    if needed == data_len {
        return Ok(None);
    }

    // Stable, equal offsets keep slot order
    live.sort_by_key(|(offset, _, _)| *offset);

    let mut out = records.to_vec();
    let mut moves = Vec::new();
    let mut cursor = start_offset;
    // End of the previous tile at its old position, never behind the cursor
    let mut prev_end = start_offset;

    for (offset, length, slot) in live {
        if offset < prev_end {
            return Err(ArchiveError::CorruptArchive(format!(
                "slot {} at offset {} overlaps bytes before {}",
                slot, offset, prev_end
            )));
        }
        prev_end = match offset.checked_add(length) {
            Some(end) if end <= data_len => end,
            _ => {
                return Err(ArchiveError::CorruptArchive(format!(
                    "slot {} runs past the data end {}",
                    slot, data_len
                )))
            }
        };

        if offset != cursor {
            moves.push(Move {
                slot,
                from: offset,
                to: cursor,
                length,
            });
            out[slot].offset = cursor;
        }
        cursor += length;
    }

    for record in out.iter_mut().filter(|r| r.is_dangling()) {
        *record = Record::EMPTY;
    }

    Ok(Some(Plan {
        moves,
        records: out,
        final_len: cursor,
    }))
}

/// Close every gap in the data file of `pair`, rewriting the index to match.
///
/// The whole layout is planned and checked before the data file is touched,
/// a corrupt archive is rejected while still intact.
pub fn trim_in_place(pair: &ArchivePair, opts: &TrimOptions) -> Result<TrimOutcome> {
    info!("trimming {:?} from offset {}", pair.data_path(), opts.start_offset);

    let records = pair.read_records()?;
    let data_len = pair.data_len()?;

    if opts.verify {
        check_layout(&records, Some(data_len))?;
    }

    let plan = match plan(&records, data_len, opts.start_offset)? {
        Some(plan) => plan,
        None => {
            info!("{:?} is already packed", pair.data_path());
            return Ok(TrimOutcome::AlreadyPacked { data_len });
        }
    };

    let shadow = if opts.shadow_index {
        Some(write_shadow(pair, &plan.records)?)
    } else {
        None
    };

    let mut handles = pair.open_for_in_place_update()?;
    for mv in plan.moves.iter() {
        debug!("slot {}: {} -> {} ({} bytes)", mv.slot, mv.from, mv.to, mv.length);

        let tile = read_tile(&mut handles.data, &Record::new(mv.from, mv.length))?;
        handles.data.seek(SeekFrom::Start(mv.to))?;
        handles.data.write_all(&tile)?;
    }
    handles.data.set_len(plan.final_len)?;
    handles.data.sync_all()?;

    match shadow {
        Some(tmp) => {
            tmp.persist(pair.index_path()).map_err(|e| e.error)?;
        }
        None => {
            warn!("rewriting {:?} in place", pair.index_path());
            rewrite_index(&mut handles.index, &plan.records)?;
        }
    }

    info!(
        "trimmed {:?} from {} to {} bytes, {} tiles moved",
        pair.data_path(),
        data_len,
        plan.final_len,
        plan.moves.len()
    );
    Ok(TrimOutcome::Trimmed {
        old_len: data_len,
        new_len: plan.final_len,
        moved: plan.moves.len() as u64,
    })
}

fn write_shadow(pair: &ArchivePair, records: &[Record]) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(scratch_dir(pair.index_path()))?;

    let len = {
        let mut writer = BlockWriter::new(BufWriter::new(tmp.as_file_mut()), Endian::Big);
        writer.write_all_records(records)?;
        writer.finish()?
    };
    tmp.as_file().set_len(len)?;
    copy_permissions(pair.index_path(), tmp.as_file())?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

// Old blocks may hold stale bytes, so nothing is skipped here
fn rewrite_index(index: &mut File, records: &[Record]) -> Result<()> {
    let bytes = encode_block(records, Endian::Big);

    index.seek(SeekFrom::Start(0))?;
    index.write_all(&bytes)?;
    index.set_len(bytes.len() as u64)?;
    index.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod test_trim {
    use super::*;
    use crate::compact::compact_copy;
    use crate::testutil::{read_index, tiles, write_archive};
    use mcore::record::BLOCK_RECORDS;
    use std::fs;

    fn gappy(dir: &std::path::Path, name: &str) -> ArchivePair {
        let mut recs = vec![Record::EMPTY; BLOCK_RECORDS * 3];
        recs[0] = Record::new(2, 3);
        recs[5] = Record::new(9, 4);
        recs[BLOCK_RECORDS * 2 + 1] = Record::new(20, 2);
        write_archive(dir, name, b"..AAA....BBBB.......CC...", &recs)
    }

    #[test]
    fn closes_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let pair = gappy(dir.path(), "a");
        let before = tiles(&pair);

        let outcome = trim_in_place(&pair, &TrimOptions::default()).unwrap();

        assert_eq!(
            outcome,
            TrimOutcome::Trimmed {
                old_len: 25,
                new_len: 9,
                moved: 3
            }
        );
        assert_eq!(fs::read(pair.data_path()).unwrap(), b"AAABBBBCC");
        assert_eq!(tiles(&pair), before);
        assert_eq!(pair.index_len().unwrap(), (BLOCK_RECORDS * 3 * 16) as u64);
    }

    #[cfg(unix)]
    #[test]
    fn shadow_index_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pair = gappy(dir.path(), "a");
        fs::set_permissions(pair.index_path(), fs::Permissions::from_mode(0o644)).unwrap();

        trim_in_place(&pair, &TrimOptions::default()).unwrap();

        let mode = fs::metadata(pair.index_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn matches_compact_copy() {
        let dir = tempfile::tempdir().unwrap();
        let trimmed = gappy(dir.path(), "trimmed");
        let source = gappy(dir.path(), "source");
        let copied = ArchivePair::new(dir.path().join("copied.dat")).unwrap();

        compact_copy(&source, &copied, None).unwrap();
        trim_in_place(&trimmed, &TrimOptions::default()).unwrap();

        assert_eq!(read_index(trimmed.index_path()), read_index(copied.index_path()));
        assert_eq!(
            fs::read(trimmed.data_path()).unwrap(),
            fs::read(copied.data_path()).unwrap()
        );
    }

    #[test]
    fn in_place_index_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let pair = gappy(dir.path(), "a");
        let opts = TrimOptions {
            shadow_index: false,
            ..TrimOptions::default()
        };

        trim_in_place(&pair, &opts).unwrap();

        let recs = read_index(pair.index_path());
        assert_eq!(recs.len(), BLOCK_RECORDS * 3);
        assert_eq!(recs[0], Record::new(0, 3));
        assert_eq!(recs[5], Record::new(3, 4));
        assert_eq!(recs[BLOCK_RECORDS * 2 + 1], Record::new(7, 2));
    }

    #[test]
    fn keeps_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let pair = write_archive(
            dir.path(),
            "a",
            b"HDR..XX..YY",
            &[Record::new(9, 2), Record::new(5, 2)],
        );
        let opts = TrimOptions {
            start_offset: 3,
            ..TrimOptions::default()
        };

        trim_in_place(&pair, &opts).unwrap();

        assert_eq!(fs::read(pair.data_path()).unwrap(), b"HDRXXYY");
        assert_eq!(
            read_index(pair.index_path()),
            vec![Record::new(5, 2), Record::new(3, 2)]
        );
    }

    #[test]
    fn packed_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pair = write_archive(dir.path(), "a", b"abcd", &[Record::new(2, 2), Record::new(0, 2)]);

        assert_eq!(
            trim_in_place(&pair, &TrimOptions::default()).unwrap(),
            TrimOutcome::AlreadyPacked { data_len: 4 }
        );
        assert_eq!(fs::read(pair.data_path()).unwrap(), b"abcd");
    }

    #[test]
    fn claims_too_much() {
        let dir = tempfile::tempdir().unwrap();
        let pair = write_archive(dir.path(), "a", b"abc", &[Record::new(0, 2), Record::new(2, 2)]);

        assert!(matches!(
            trim_in_place(&pair, &TrimOptions::default()),
            Err(ArchiveError::CorruptArchive(_))
        ));
        assert_eq!(fs::read(pair.data_path()).unwrap(), b"abc");
    }

    #[test]
    fn overlap_rejected_before_moving() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"....AAAA..........";
        let recs = [Record::new(4, 4), Record::new(6, 4)];
        let opts = TrimOptions {
            verify: false,
            ..TrimOptions::default()
        };

        for opts in [TrimOptions::default(), opts] {
            let pair = write_archive(dir.path(), "a", data, &recs);
            assert!(matches!(
                trim_in_place(&pair, &opts),
                Err(ArchiveError::CorruptArchive(_))
            ));
            assert_eq!(fs::read(pair.data_path()).unwrap(), data);
            assert_eq!(read_index(pair.index_path()), recs);
        }
    }

    #[test]
    fn plan_skips_packed_prefix() {
        let recs = [Record::new(0, 2), Record::EMPTY, Record::new(5, 1)];
        let plan = plan(&recs, 8, 0).unwrap().unwrap();

        assert_eq!(
            plan.moves,
            vec![Move {
                slot: 2,
                from: 5,
                to: 2,
                length: 1
            }]
        );
        assert_eq!(plan.final_len, 3);
    }
}
