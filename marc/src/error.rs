use std::path::PathBuf;

use mcore::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("malformed index: length {len} is not a whole number of records")]
    MalformedIndex { len: u64 },

    #[error("truncated read at offset {offset}: expected {expected} bytes, got {actual}")]
    TruncatedRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("index size mismatch: {path:?} is {actual} bytes, expected {expected}")]
    IndexSizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("index read mismatch in {path:?} at byte {position}: read {actual}, expected {expected}")]
    IndexReadMismatch {
        path: PathBuf,
        position: u64,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("size conflict: {path:?} is {actual} bytes, larger than {expected}")]
    SizeConflict {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("metadata {path:?}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("bad archive name {0:?}")]
    BadName(PathBuf),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("packed index: {0}")]
    PackedIndex(String),
}

impl From<CodecError> for ArchiveError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::IOError(e) => ArchiveError::IOError(e),
            CodecError::MalformedIndex { len } => ArchiveError::MalformedIndex { len },
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
