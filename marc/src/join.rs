use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use mcore::block::fill_block;
use mcore::record::{decode_block, encode_block, is_all_empty, BLOCK_SIZE};
use mcore::{Endian, Record};

use crate::accessor::append_file;
use crate::archive::{ArchivePair, OutputGuard};
use crate::error::{ArchiveError, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinStats {
    pub inputs: usize,
    pub slots_written: u64,
    pub bytes_appended: u64,
}

/// Merge `input` into the index open as `out`, shifting every live record
/// by `base`.
///
/// Both indexes are walked a block at a time in lockstep. Each non-empty
/// input slot replaces the output slot, all empty input blocks leave the
/// output untouched. Returns the number of slots written.
pub fn merge_index<F, R>(out: &mut F, input: &mut R, base: u64, path: &Path) -> Result<u64>
where
    F: Read + Write + Seek,
    R: Read,
{
    let mut in_buf = [0u8; BLOCK_SIZE];
    let mut out_buf = [0u8; BLOCK_SIZE];
    let mut position = 0;
    let mut written = 0;

    out.seek(SeekFrom::Start(0))?;
    loop {
        let in_len = fill_block(input, &mut in_buf)?;
        let out_len = fill_block(out, &mut out_buf)?;

        if in_len != out_len {
            return Err(ArchiveError::IndexReadMismatch {
                path: path.to_path_buf(),
                position,
                expected: out_len as u64,
                actual: in_len as u64,
            });
        }
        if in_len == 0 {
            break;
        }

        let incoming = decode_block(&in_buf[..in_len], Endian::Big).map_err(|_| {
            ArchiveError::MalformedIndex {
                len: position + in_len as u64,
            }
        })?;
        if is_all_empty(&incoming) {
            position += in_len as u64;
            continue;
        }

        let mut records = decode_block(&out_buf[..out_len], Endian::Big)?;
        for (dst, src) in records.iter_mut().zip(incoming.iter()) {
            if src.is_empty() {
                continue;
            }
            let offset = src.offset.checked_add(base).ok_or_else(|| {
                ArchiveError::CorruptArchive(format!("offset {} + {} overflows", src.offset, base))
            })?;
            *dst = Record::new(offset, src.length);
            written += 1;
        }

        out.seek(SeekFrom::Current(-(out_len as i64)))?;
        out.write_all(&encode_block(&records, Endian::Big))?;
        position += in_len as u64;
    }

    debug!("merged {} slots from {:?} at base {}", written, path, base);
    Ok(written)
}

/// Join `inputs` into `output`, later inputs winning any slot they share
/// with earlier ones.
///
/// Each input's data file is appended to the output data file and its
/// records shifted by the length the output data had before. With
/// `forced_offset` nothing is copied, the single input's records are shifted
/// by that value instead.
///
/// A missing output is seeded from the first input: its metadata and index
/// are copied and an empty data file is created unless one is already there,
/// in which case the inputs are appended after its bytes. If the run fails
/// the files created here are removed again, nothing that existed before is
/// deleted.
pub fn join(inputs: &[ArchivePair], output: &ArchivePair, forced_offset: Option<u64>) -> Result<JoinStats> {
    let first = inputs
        .first()
        .ok_or_else(|| ArchiveError::InvalidRequest("no input archives".to_string()))?;
    if forced_offset.is_some() && inputs.len() > 1 {
        return Err(ArchiveError::InvalidRequest(
            "a forced offset takes exactly one input".to_string(),
        ));
    }

    if let Some(input) = inputs.iter().find(|i| i.same_data(output)) {
        return Err(ArchiveError::InvalidRequest(format!(
            "{:?} is both an input and the output",
            input.data_path()
        )));
    }

    let expected = first.index_len()?;
    for input in inputs.iter() {
        let actual = input.index_len()?;
        if actual != expected {
            return Err(ArchiveError::IndexSizeMismatch {
                path: input.index_path().to_path_buf(),
                expected,
                actual,
            });
        }
    }

    let mut guard = OutputGuard::new();
    if output.index_exists() {
        let actual = output.index_len()?;
        if actual != expected {
            return Err(ArchiveError::IndexSizeMismatch {
                path: output.index_path().to_path_buf(),
                expected,
                actual,
            });
        }
    } else {
        seed_output(first, output, forced_offset.is_none(), &mut guard)?;
    }

    info!(
        "joining {} archives into {:?}",
        inputs.len(),
        output.data_path()
    );

    let mut out_index = OpenOptions::new()
        .read(true)
        .write(true)
        .open(output.index_path())?;
    let mut out_data = match forced_offset {
        Some(_) => None,
        None => Some(OpenOptions::new().read(true).write(true).open(output.data_path())?),
    };

    let mut stats = JoinStats::default();
    for input in inputs.iter() {
        // Data is only open when no offset was forced
        let base = match out_data.as_mut() {
            Some(data) => {
                let base = data.seek(SeekFrom::End(0))?;
                stats.bytes_appended += append_file(input.data_path(), data)?;
                base
            }
            None => forced_offset.unwrap_or_default(),
        };

        let mut in_index = BufReader::new(File::open(input.index_path())?);
        stats.slots_written += merge_index(&mut out_index, &mut in_index, base, input.index_path())?;
        stats.inputs += 1;
    }

    out_index.sync_all()?;
    if let Some(data) = out_data {
        data.sync_all()?;
    }
    guard.commit();

    info!(
        "joined {} archives, {} slots written, {} bytes appended",
        stats.inputs, stats.slots_written, stats.bytes_appended
    );
    Ok(stats)
}

fn seed_output(first: &ArchivePair, output: &ArchivePair, create_data: bool, guard: &mut OutputGuard) -> Result<()> {
    debug!("seeding {:?} from {:?}", output.index_path(), first.index_path());

    if first.meta_path().is_file() && !output.meta_path().exists() {
        guard.track(output.meta_path());
        fs::copy(first.meta_path(), output.meta_path())?;
    }

    guard.track(output.index_path());
    fs::copy(first.index_path(), output.index_path())?;

    if create_data && !output.data_exists() {
        guard.track(output.data_path());
        File::create(output.data_path())?;
    }
    Ok(())
}

#[cfg(test)]
mod test_join {
    use super::*;
    use crate::testutil::{read_index, tiles, write_archive, write_meta};
    use mcore::record::{BLOCK_RECORDS, RECORD_SIZE};
    use std::io::Cursor;

    fn one_tile(dir: &Path, name: &str, slot: usize, slots: usize, bytes: &[u8]) -> ArchivePair {
        let mut recs = vec![Record::EMPTY; slots];
        recs[slot] = Record::new(0, bytes.len() as u64);
        write_archive(dir, name, bytes, &recs)
    }

    #[test]
    fn offsets_follow_data() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 4, &[b'a'; 10]);
        let b = one_tile(dir.path(), "b", 1, 4, &[b'b'; 20]);
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        let stats = join(&[a, b], &out, None).unwrap();

        assert_eq!(stats.bytes_appended, 30);
        let mut expected = vec![b'a'; 10];
        expected.extend_from_slice(&[b'b'; 20]);
        assert_eq!(fs::read(out.data_path()).unwrap(), expected);
        assert_eq!(
            read_index(out.index_path()),
            vec![Record::new(0, 10), Record::new(10, 20), Record::EMPTY, Record::EMPTY]
        );
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 2, 3, b"old");
        let b = one_tile(dir.path(), "b", 2, 3, b"newer");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        join(&[a, b], &out, None).unwrap();

        assert_eq!(fs::read(out.data_path()).unwrap(), b"oldnewer");
        assert_eq!(read_index(out.index_path())[2], Record::new(3, 5));
        assert_eq!(tiles(&out)[2], Some(b"newer".to_vec()));
    }

    #[test]
    fn appends_to_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"first");
        let b = one_tile(dir.path(), "b", 1, 2, b"second");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        join(&[a], &out, None).unwrap();
        join(&[b], &out, None).unwrap();

        assert_eq!(fs::read(out.data_path()).unwrap(), b"firstsecond");
        assert_eq!(
            read_index(out.index_path()),
            vec![Record::new(0, 5), Record::new(5, 6)]
        );
    }

    #[test]
    fn forced_offset_copies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 1, 2, b"tile");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        let stats = join(&[a], &out, Some(1000)).unwrap();

        assert_eq!(stats.bytes_appended, 0);
        assert!(!out.data_exists());
        assert_eq!(read_index(out.index_path()), vec![Record::EMPTY, Record::new(1000, 4)]);
    }

    #[test]
    fn forced_offset_single_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 1, b"a");
        let b = one_tile(dir.path(), "b", 0, 1, b"b");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        assert!(matches!(
            join(&[a, b], &out, Some(0)),
            Err(ArchiveError::InvalidRequest(_))
        ));
        assert!(matches!(
            join(&[], &out, None),
            Err(ArchiveError::InvalidRequest(_))
        ));
    }

    #[test]
    fn size_mismatch_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"a");
        let b = one_tile(dir.path(), "b", 0, 3, b"b");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        match join(&[a, b], &out, None) {
            Err(ArchiveError::IndexSizeMismatch { expected, actual, .. }) => {
                assert_eq!((expected, actual), (32, 48))
            }
            x => panic!("unexpected: {:?}", x),
        }
        assert!(!out.index_exists());
        assert!(!out.data_exists());
    }

    #[test]
    fn failed_seed_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"a");
        write_meta(a.meta_path(), 512, 512, 1, 512, None);
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();
        fs::remove_file(a.data_path()).unwrap();

        assert!(matches!(join(&[a], &out, None), Err(ArchiveError::IOError(_))));
        assert!(!out.index_exists());
        assert!(!out.data_exists());
        assert!(!out.meta_path().exists());
    }

    #[test]
    fn seed_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 1, 2, b"tile");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();
        fs::write(out.data_path(), b"PRECIOUS").unwrap();

        join(&[a], &out, None).unwrap();

        assert_eq!(fs::read(out.data_path()).unwrap(), b"PRECIOUStile");
        assert_eq!(read_index(out.index_path()), vec![Record::EMPTY, Record::new(8, 4)]);
    }

    #[test]
    fn failed_seed_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"a");
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();
        fs::write(out.data_path(), b"PRECIOUS").unwrap();
        fs::remove_file(a.data_path()).unwrap();

        assert!(matches!(join(&[a], &out, None), Err(ArchiveError::IOError(_))));
        assert!(!out.index_exists());
        assert_eq!(fs::read(out.data_path()).unwrap(), b"PRECIOUS");
    }

    #[test]
    fn output_as_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"a");
        let out = one_tile(dir.path(), "out", 1, 2, b"b");
        let same = ArchivePair::new(dir.path().join(".").join("out.dat")).unwrap();

        assert!(matches!(
            join(&[a, same], &out, None),
            Err(ArchiveError::InvalidRequest(_))
        ));
        assert_eq!(fs::read(out.data_path()).unwrap(), b"b");
    }

    #[test]
    fn seed_copies_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let a = one_tile(dir.path(), "a", 0, 2, b"a");
        write_meta(a.meta_path(), 512, 512, 1, 512, None);
        let out = ArchivePair::new(dir.path().join("out.dat")).unwrap();

        join(&[a.clone()], &out, None).unwrap();

        assert_eq!(
            fs::read(out.meta_path()).unwrap(),
            fs::read(a.meta_path()).unwrap()
        );
    }

    #[test]
    fn merge_skips_empty_input_blocks() {
        let mut out_recs = vec![Record::new(7, 7); BLOCK_RECORDS * 2];
        out_recs[BLOCK_RECORDS + 1] = Record::EMPTY;
        let mut out = Cursor::new(encode_block(&out_recs, Endian::Big));

        let mut in_recs = vec![Record::EMPTY; BLOCK_RECORDS * 2];
        in_recs[BLOCK_RECORDS + 1] = Record::new(1, 2);
        let mut input = Cursor::new(encode_block(&in_recs, Endian::Big));

        let written = merge_index(&mut out, &mut input, 100, Path::new("in.idx")).unwrap();

        assert_eq!(written, 1);
        let merged = decode_block(out.get_ref(), Endian::Big).unwrap();
        assert_eq!(merged[0], Record::new(7, 7));
        assert_eq!(merged[BLOCK_RECORDS + 1], Record::new(101, 2));
        assert_eq!(merged.len(), BLOCK_RECORDS * 2);
    }

    #[test]
    fn merge_length_mismatch() {
        let mut out = Cursor::new(vec![0u8; RECORD_SIZE * 3]);
        let mut input = Cursor::new(vec![0u8; RECORD_SIZE * 2]);

        match merge_index(&mut out, &mut input, 0, Path::new("in.idx")) {
            Err(ArchiveError::IndexReadMismatch {
                position,
                expected,
                actual,
                ..
            }) => assert_eq!((position, expected, actual), (0, 48, 32)),
            x => panic!("unexpected: {:?}", x),
        }
    }
}
