use std::io::{BufReader, BufWriter, Write};

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use mcore::block::{BlockReader, BlockWriter};
use mcore::{Endian, Record};

use crate::accessor::{append_tile, copy_tile};
use crate::archive::{copy_permissions, scratch_dir, ArchivePair};
use crate::error::Result;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactStats {
    pub slots: u64,
    pub tiles: u64,
    pub index_len: u64,
    pub data_len: u64,
}

/// Copy the live tiles of `source` into `dest`, dropping all slack.
///
/// Tiles are written in slot order, each empty slot becomes `(0, 0)` and all
/// empty index blocks are left as holes. When given, `seed` is written at the
/// start of the destination data file and tiles follow it.
///
/// Both destination files are staged as temporary files next to `dest` and
/// only renamed into place once complete, a failed run leaves `dest` as it
/// was.
pub fn compact_copy(source: &ArchivePair, dest: &ArchivePair, seed: Option<&[u8]>) -> Result<CompactStats> {
    info!(
        "compacting {:?} into {:?}",
        source.data_path(),
        dest.data_path()
    );

    let handles = source.open_for_read()?;
    let mut src_data = BufReader::new(handles.data);
    let blocks = BlockReader::new(BufReader::new(handles.index), Endian::Big);

    let mut data_tmp = NamedTempFile::new_in(scratch_dir(dest.data_path()))?;
    let mut index_tmp = NamedTempFile::new_in(scratch_dir(dest.index_path()))?;

    let mut stats = CompactStats::default();
    let mut cursor = 0;

    {
        let mut data_out = BufWriter::new(data_tmp.as_file_mut());
        let mut index_out = BlockWriter::new(BufWriter::new(index_tmp.as_file_mut()), Endian::Big);

        if let Some(seed) = seed {
            cursor = append_tile(&mut data_out, cursor, seed)?;
            debug!("seeded with {} bytes", cursor);
        }

        for block in blocks {
            let mut block = block?;
            stats.slots += block.records.len() as u64;

            if block.is_empty() {
                index_out.skip(block.byte_len() as u64)?;
                continue;
            }

            for record in block.records.iter_mut() {
                if record.is_empty() {
                    if record.is_dangling() {
                        warn!("slot has offset {} but no length, cleared", record.offset);
                    }
                    *record = Record::EMPTY;
                    continue;
                }

                copy_tile(&mut src_data, record, &mut data_out)?;
                record.offset = cursor;
                cursor += record.length;
                stats.tiles += 1;
            }

            index_out.write_block(&block.records)?;
        }

        stats.index_len = index_out.finish()?;
        data_out.flush()?;
    }
    stats.data_len = cursor;

    // A trailing hole is not written, size both files explicitly
    index_tmp.as_file().set_len(stats.index_len)?;
    data_tmp.as_file().set_len(stats.data_len)?;
    copy_permissions(source.index_path(), index_tmp.as_file())?;
    copy_permissions(source.data_path(), data_tmp.as_file())?;

    data_tmp.persist(dest.data_path()).map_err(|e| e.error)?;
    index_tmp.persist(dest.index_path()).map_err(|e| e.error)?;

    info!(
        "compacted {} tiles in {} slots, data {} bytes",
        stats.tiles, stats.slots, stats.data_len
    );
    Ok(stats)
}
