//! Stacking 2-D archives as slices of a 3-D archive.
//!
//! The output index holds every level of every slice. Levels are contiguous
//! super blocks, inside one level the slices follow each other:
//!
//! ```text
//! | L0 s0 | L0 s1 | .. | L0 sN | L1 s0 | L1 s1 | .. | L1 sN | ..
//! ```
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};

use log::{debug, info};

use mcore::record::RECORD_SIZE;
use mcore::{Endian, Record};

use crate::accessor::append_file;
use crate::archive::{ArchivePair, Handles, OutputGuard};
use crate::error::{ArchiveError, Result};
use crate::meta::{write_with_z, PageLayout, RasterInfo};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ZStackStats {
    pub slices: u32,
    pub records: u64,
    pub bytes_appended: u64,
}

/// Append `inputs` as consecutive slices of `output`, the first one landing
/// on `start_slice`.
///
/// The page layout comes from the metadata of the first input and is assumed
/// to hold for every input. A missing output metadata file is written from
/// that same document with its z size set to `target_slices`.
pub fn append_slices(
    inputs: &[ArchivePair],
    output: &ArchivePair,
    target_slices: u32,
    start_slice: u32,
) -> Result<ZStackStats> {
    let first = inputs
        .first()
        .ok_or_else(|| ArchiveError::InvalidRequest("no input archives".to_string()))?;
    let layout = RasterInfo::load(first.meta_path())?.layout();

    let mut guard = OutputGuard::new();
    if !output.meta_path().exists() {
        guard.track(output.meta_path());
        write_with_z(first.meta_path(), output.meta_path(), target_slices)?;
    }

    let stats = append_slices_with_layout(&layout, inputs, output, target_slices, start_slice)?;
    guard.commit();
    Ok(stats)
}

/// [`append_slices`] with a known layout, the metadata files are not read
/// or written
pub fn append_slices_with_layout(
    layout: &PageLayout,
    inputs: &[ArchivePair],
    output: &ArchivePair,
    target_slices: u32,
    start_slice: u32,
) -> Result<ZStackStats> {
    if inputs.is_empty() {
        return Err(ArchiveError::InvalidRequest("no input archives".to_string()));
    }
    let end_slice = start_slice as u64 + inputs.len() as u64;
    if end_slice > target_slices as u64 {
        return Err(ArchiveError::InvalidRequest(format!(
            "slices {}..{} do not fit in {} slices",
            start_slice, end_slice, target_slices
        )));
    }

    let out_ext = output.data_path().extension();
    for input in inputs.iter() {
        if input.same_data(output) {
            return Err(ArchiveError::InvalidRequest(format!(
                "{:?} is both an input and the output",
                input.data_path()
            )));
        }
        if input.data_path().extension() != out_ext {
            return Err(ArchiveError::InvalidRequest(format!(
                "{:?} does not have the output data extension",
                input.data_path()
            )));
        }
    }

    let slices = target_slices as u64;
    let input_len = RECORD_SIZE as u64 * layout.total_pages();
    let output_len = input_len * slices;

    info!(
        "stacking {} slices from {} into {:?}, {} levels of {} slices",
        inputs.len(),
        start_slice,
        output.data_path(),
        layout.levels(),
        target_slices
    );

    let mut guard = OutputGuard::new();
    let Handles {
        index: mut out_index,
        data: mut out_data,
    } = open_output(output, output_len, &mut guard)?;

    let mut stats = ZStackStats::default();
    for (input, slice) in inputs.iter().zip(start_slice as u64..) {
        let actual = input.index_len()?;
        if actual != input_len {
            return Err(ArchiveError::IndexSizeMismatch {
                path: input.index_path().to_path_buf(),
                expected: input_len,
                actual,
            });
        }

        let data_offset = out_data.seek(SeekFrom::End(0))?;
        stats.bytes_appended += append_file(input.data_path(), &mut out_data)?;

        let mut in_index = BufReader::new(File::open(input.index_path())?);
        for level in 0..layout.levels() {
            let slot = layout.slot_of(level, slice, slices);
            out_index.seek(SeekFrom::Start(slot * RECORD_SIZE as u64))?;

            stats.records += copy_level(&mut in_index, &mut out_index, layout.pages(level), data_offset)?;
        }

        debug!("slice {} from {:?} at data offset {}", slice, input.data_path(), data_offset);
        stats.slices += 1;
    }

    out_index.sync_all()?;
    out_data.sync_all()?;
    guard.commit();

    info!(
        "stacked {} slices, {} records, {} bytes appended",
        stats.slices, stats.records, stats.bytes_appended
    );
    Ok(stats)
}

/// Handles on the output, its index sized to `len` bytes. Only files made
/// here are handed to `guard`.
fn open_output(output: &ArchivePair, len: u64, guard: &mut OutputGuard) -> Result<Handles> {
    if !output.index_exists() && !output.data_exists() {
        guard.track(output.index_path());
        guard.track(output.data_path());

        let handles = output.create_for_write()?;
        handles.index.set_len(len)?;
        return Ok(handles);
    }

    size_index(output, len, guard)?;
    if !output.data_exists() {
        guard.track(output.data_path());
        File::create(output.data_path())?;
    }
    output.open_for_in_place_update()
}

/// Create the output index at `len` bytes or extend an existing one to it
fn size_index(output: &ArchivePair, len: u64, guard: &mut OutputGuard) -> Result<()> {
    if output.index_exists() {
        let actual = output.index_len()?;
        if actual > len {
            return Err(ArchiveError::SizeConflict {
                path: output.index_path().to_path_buf(),
                expected: len,
                actual,
            });
        }
        output.truncate_index(len)
    } else {
        guard.track(output.index_path());
        File::create(output.index_path())?.set_len(len)?;
        Ok(())
    }
}

// Record at a time, a level need not fill whole blocks
fn copy_level<R: Read, W: Write + Seek>(input: &mut R, out: &mut W, pages: u64, data_offset: u64) -> Result<u64> {
    let mut buf = [0u8; RECORD_SIZE];
    let mut copied = 0;

    for _ in 0..pages {
        input.read_exact(&mut buf)?;
        let record = Record::decode(&buf, Endian::Big);

        if record.is_empty() {
            out.seek(SeekFrom::Current(RECORD_SIZE as i64))?;
            continue;
        }

        let offset = record.offset.checked_add(data_offset).ok_or_else(|| {
            ArchiveError::CorruptArchive(format!("offset {} + {} overflows", record.offset, data_offset))
        })?;
        out.write_all(&Record::new(offset, record.length).encode(Endian::Big))?;
        copied += 1;
    }
    Ok(copied)
}
