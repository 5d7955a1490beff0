use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;

use mcore::block::BlockReader;
use mcore::record::RECORD_SIZE;
use mcore::{Endian, Record};

use crate::error::{ArchiveError, Result};

/// How companion file names are derived from the data file name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Naming {
    pub index_extension: String,
    pub metadata_extension: String,
}

impl Default for Naming {
    fn default() -> Self {
        Naming {
            index_extension: "idx".to_string(),
            metadata_extension: "mrf".to_string(),
        }
    }
}

/// Open file handles of one archive, closed on drop
#[derive(Debug)]
pub struct Handles {
    pub index: File,
    pub data: File,
}

/// One archive: a data file plus its index and metadata companions.
///
/// The pair holds paths only, every engine run opens its own handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePair {
    data: PathBuf,
    index: PathBuf,
    meta: PathBuf,
}

impl ArchivePair {
    pub fn new<P: AsRef<Path>>(data: P) -> Result<Self> {
        Self::with_naming(data, &Naming::default())
    }

    /// Derive the companions by swapping the data file extension
    pub fn with_naming<P: AsRef<Path>>(data: P, naming: &Naming) -> Result<Self> {
        let data = data.as_ref().to_path_buf();
        if data.file_name().is_none() {
            return Err(ArchiveError::BadName(data));
        }

        // The data file name must not collide with its own companions
        if let Some(ext) = data.extension().and_then(|e| e.to_str()) {
            if ext == naming.index_extension || ext == naming.metadata_extension {
                return Err(ArchiveError::BadName(data));
            }
        }

        Ok(ArchivePair {
            index: data.with_extension(&naming.index_extension),
            meta: data.with_extension(&naming.metadata_extension),
            data,
        })
    }

    /// Pair a data file with an index that does not follow the naming convention
    pub fn with_index<P: AsRef<Path>, Q: AsRef<Path>>(data: P, index: Q) -> Result<Self> {
        let mut pair = Self::new(data)?;
        pair.index = index.as_ref().to_path_buf();
        Ok(pair)
    }

    pub fn data_path(&self) -> &Path {
        &self.data
    }

    pub fn index_path(&self) -> &Path {
        &self.index
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta
    }

    /// Both pairs name the same data file
    pub fn same_data(&self, other: &ArchivePair) -> bool {
        match (fs::canonicalize(&self.data), fs::canonicalize(&other.data)) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.data == other.data,
        }
    }

    pub fn index_exists(&self) -> bool {
        self.index.is_file()
    }

    pub fn data_exists(&self) -> bool {
        self.data.is_file()
    }

    pub fn index_len(&self) -> Result<u64> {
        Ok(fs::metadata(&self.index)?.len())
    }

    pub fn data_len(&self) -> Result<u64> {
        Ok(fs::metadata(&self.data)?.len())
    }

    pub fn slot_count(&self) -> Result<u64> {
        let len = self.index_len()?;
        if len % RECORD_SIZE as u64 != 0 {
            return Err(ArchiveError::MalformedIndex { len });
        }
        Ok(len / RECORD_SIZE as u64)
    }

    pub fn open_for_read(&self) -> Result<Handles> {
        Ok(Handles {
            index: File::open(&self.index)?,
            data: File::open(&self.data)?,
        })
    }

    /// Truncate-create both files
    pub fn create_for_write(&self) -> Result<Handles> {
        Ok(Handles {
            index: File::create(&self.index)?,
            data: File::create(&self.data)?,
        })
    }

    pub fn open_for_in_place_update(&self) -> Result<Handles> {
        let open = |path: &Path| OpenOptions::new().read(true).write(true).open(path);

        Ok(Handles {
            index: open(&self.index)?,
            data: open(&self.data)?,
        })
    }

    pub fn truncate_index(&self, len: u64) -> Result<()> {
        set_file_len(&self.index, len)
    }

    pub fn truncate_data(&self, len: u64) -> Result<()> {
        set_file_len(&self.data, len)
    }

    /// The whole index, in slot order
    pub fn read_records(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let reader = BlockReader::new(BufReader::new(File::open(&self.index)?), Endian::Big);

        for block in reader {
            records.extend(block?.records);
        }
        Ok(records)
    }

    pub fn read_slot(&self, slot: u64) -> Result<Record> {
        let mut index = File::open(&self.index)?;
        read_slot_from(&mut index, slot, Endian::Big)
    }
}

pub fn read_slot_from<R: Read + Seek>(index: &mut R, slot: u64, order: Endian) -> Result<Record> {
    let mut buf = [0u8; RECORD_SIZE];

    let position = slot.checked_mul(RECORD_SIZE as u64).ok_or_else(|| {
        ArchiveError::InvalidRequest(format!("slot {} is past the end of the index", slot))
    })?;

    index.seek(SeekFrom::Start(position))?;
    match index.read_exact(&mut buf) {
        Ok(()) => Ok(Record::decode(&buf, order)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ArchiveError::InvalidRequest(
            format!("slot {} is past the end of the index", slot),
        )),
        Err(e) => Err(e.into()),
    }
}

fn set_file_len(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    Ok(())
}

/// Give `to` the permissions of the file at `from`, scratch files start out
/// owner-only
pub fn copy_permissions(from: &Path, to: &File) -> Result<()> {
    to.set_permissions(fs::metadata(from)?.permissions())?;
    Ok(())
}

/// Directory to create scratch files in, next to `path` so a rename stays on
/// one filesystem
pub fn scratch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Removes the tracked files on drop unless committed.
///
/// Only track files the current run created, pre-existing outputs must never
/// be handed to a guard.
#[derive(Debug, Default)]
pub struct OutputGuard {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl OutputGuard {
    pub fn new() -> Self {
        OutputGuard::default()
    }

    pub fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for path in self.paths.iter().rev() {
            match fs::remove_file(path) {
                Ok(()) => debug!("removed partial output {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => warn!("failed to remove partial output {:?}: {}", path, e),
            }
        }
    }
}
