use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// The primary error type for all operations in the `dirvault` crate.
#[derive(Debug, Error)]
pub enum VaultError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{path}': {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// A persisted index row could not be parsed. Fatal for the whole run,
    /// before any output is written.
    #[error("backup index '{path}' is corrupt: {detail}")]
    IndexCorrupt { path: PathBuf, detail: String },

    /// The directory a backup or sync run should read from does not exist.
    #[error("source directory '{0}' does not exist")]
    SourceMissing(PathBuf),

    /// A container named by the index is absent from the backup storage.
    #[error("archive '{0}' referenced by the index is missing")]
    ArchiveMissing(String),

    /// The background scan task of the sync pipeline failed; surfaced to the
    /// caller only after the action queue has fully drained.
    #[error("background scan failed: {0}")]
    ScanFailed(#[source] Box<VaultError>),

    /// The retry policy gave up on an I/O operation (or the user declined a
    /// retry); terminates the run.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An exclude/include pattern did not compile.
    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// An error from the underlying zip container.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl VaultError {
    /// Attaches a path to a raw I/O error.
    pub fn io(source: io::Error, path: impl AsRef<Path>) -> Self {
        VaultError::Io {
            source,
            path: path.as_ref().to_path_buf(),
        }
    }
}

// Generic IO error conversion that doesn't carry a path
impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        VaultError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}
