//! Archive naming, the per-run archive planner, and container I/O.
//!
//! A backup run produces two kinds of containers. Small changed files are
//! bundled into one freshly named shared zip per run; larger files each get a
//! standalone container, gzip-compressed unless the extension is on the
//! no-compress list. The container kind is always recoverable from the name
//! alone: `.gz` and `.nopack` suffixes mark per-file containers, everything
//! else is a shared zip.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{Datelike, Timelike};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::index::{FileState, IndexEntry};
use crate::safeio::DurableFile;
use crate::VaultError;

/// Name of the index file inside a backup target directory.
pub const INDEX_FILE_NAME: &str = "index.txt.gz";
/// Deferred-removal list written in shadow-index mode.
pub const REMOVAL_LIST_NAME: &str = "index_rm.txt";
/// Files below this size share the run's zip archive.
pub const DEFAULT_SIZE_THRESHOLD: u64 = 50 * 1024 * 1024;
/// Extensions whose content is stored rather than deflated.
pub const DEFAULT_NO_COMPRESS: &[&str] = &[".jpg", ".gz", ".zip", ".7z", ".mp3", ".ac3"];

/// Fresh name for a run's shared zip archive.
pub fn new_run_archive_name() -> String {
    format!("{:032x}.zip", rand::random::<u128>())
}

/// Fresh name for a per-file container. Keeps the original extension for
/// legibility and appends the suffix that encodes the container kind.
pub fn new_container_name(relative_path: &str, compress: bool) -> String {
    let ext = Path::new(relative_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let suffix = if compress { ".gz" } else { ".nopack" };
    format!("{:032x}{}{}", rand::random::<u128>(), ext, suffix)
}

pub fn is_gzip_name(name: &str) -> bool {
    name.to_lowercase().ends_with(".gz")
}

pub fn is_nopack_name(name: &str) -> bool {
    name.to_lowercase().ends_with(".nopack")
}

/// True for single-entry containers; false means shared zip.
pub fn is_direct_container(name: &str) -> bool {
    is_gzip_name(name) || is_nopack_name(name)
}

/// Whether a file's content should be deflated, by extension. An empty
/// no-compress list compresses everything.
pub fn should_compress(relative_path: &str, no_compress: &[String]) -> bool {
    let lower = relative_path.to_lowercase();
    !no_compress
        .iter()
        .any(|ext| lower.ends_with(&ext.to_lowercase()))
}

/// Zip entry names use forward slashes and no leading slash, independent of
/// the platform the index was produced on.
pub fn clean_entry_name(relative_path: &str) -> String {
    relative_path
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// Per-run archive reference counts, the input to garbage collection.
#[derive(Default)]
pub struct ArchiveUsage {
    counts: HashMap<String, u32>,
}

impl ArchiveUsage {
    /// Counts one surviving reference to `name`.
    pub fn record_use(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Registers `name` with zero references unless it is already counted;
    /// used for entries whose live file disappeared.
    pub fn record_orphan(&mut self, name: &str) {
        self.counts.entry(name.to_string()).or_insert(0);
    }

    /// Archive names that ended the run with no references.
    pub fn unreferenced(&self) -> impl Iterator<Item = &str> {
        self.counts
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(name, _)| name.as_str())
    }

    pub fn count(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }
}

/// Decides where each changed file's content goes and tracks the reference
/// counts that drive archive cleanup.
pub struct ArchivePlanner {
    run_archive: String,
    size_threshold: u64,
    no_compress: Vec<String>,
    usage: ArchiveUsage,
    pub modified: u64,
    pub unmodified: u64,
    pub zipped: u64,
    pub total_bytes: u64,
}

impl ArchivePlanner {
    pub fn new(size_threshold: u64, no_compress: Vec<String>) -> Self {
        Self {
            run_archive: new_run_archive_name(),
            size_threshold,
            no_compress,
            usage: ArchiveUsage::default(),
            modified: 0,
            unmodified: 0,
            zipped: 0,
            total_bytes: 0,
        }
    }

    /// Name of this run's shared zip archive.
    pub fn run_archive(&self) -> &str {
        &self.run_archive
    }

    /// Assigns a container to a Modified entry. Shared-archive membership is
    /// decided purely by size; a large entry keeps its existing per-file
    /// container name so the rewrite replaces it in place.
    pub fn plan_modified(&mut self, entry: &mut IndexEntry) {
        debug_assert_eq!(entry.state, FileState::Modified);
        let previous = entry.archive_name.clone();
        if entry.length < self.size_threshold {
            self.zipped += 1;
            entry.archive_name = self.run_archive.clone();
        } else if entry.archive_name.is_empty() || !is_direct_container(&entry.archive_name) {
            let compress = should_compress(&entry.relative_path, &self.no_compress);
            entry.archive_name = new_container_name(&entry.relative_path, compress);
        }
        // a superseded container must enter the reference table or cleanup
        // would never see it
        if !previous.is_empty() && previous != entry.archive_name {
            self.usage.record_orphan(&previous);
        }
        self.modified += 1;
        self.total_bytes += entry.length;
        self.usage.record_use(&entry.archive_name);
    }

    /// Counts an Unmodified entry's archive as still referenced.
    pub fn note_unmodified(&mut self, entry: &IndexEntry) {
        self.unmodified += 1;
        self.usage.record_use(&entry.archive_name);
    }

    /// Registers the prior archive of an entry whose live file is gone.
    pub fn note_orphan(&mut self, entry: &IndexEntry) {
        if !entry.archive_name.is_empty() {
            self.usage.record_orphan(&entry.archive_name);
        }
    }

    pub fn usage(&self) -> &ArchiveUsage {
        &self.usage
    }

    pub fn should_compress(&self, relative_path: &str) -> bool {
        should_compress(relative_path, &self.no_compress)
    }
}

/// Writer for the run's shared zip archive, backed by a durable file so an
/// aborted run never leaves a truncated zip behind.
pub struct RunArchiveWriter {
    zip: ZipWriter<DurableFile>,
    no_compress: Vec<String>,
}

impl RunArchiveWriter {
    pub fn create(target: &Path, no_compress: Vec<String>) -> Result<Self, VaultError> {
        let out = DurableFile::create(target).map_err(|e| VaultError::io(e, target))?;
        Ok(Self {
            zip: ZipWriter::new(out),
            no_compress,
        })
    }

    /// Appends one file's content under the entry's relative path. The zip's
    /// native timestamp carries the modification time; authoritative metadata
    /// lives in the index.
    pub fn add_entry(&mut self, entry: &IndexEntry, src: &mut dyn Read) -> Result<u64, VaultError> {
        let method = if should_compress(&entry.relative_path, &self.no_compress) {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };

        let mut options = FileOptions::default()
            .compression_method(method)
            .large_file(entry.length >= u32::MAX as u64);
        let t = entry.modified_at;
        if let Ok(dt) = zip::DateTime::from_date_and_time(
            t.year() as u16,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
        ) {
            options = options.last_modified_time(dt);
        }

        self.zip
            .start_file(clean_entry_name(&entry.relative_path), options)?;
        let written = io::copy(src, &mut self.zip)?;
        Ok(written)
    }

    /// Finishes the zip stream and commits the durable file.
    pub fn finish(mut self) -> Result<(), VaultError> {
        let out = self.zip.finish()?;
        let target = out.target().to_path_buf();
        out.commit().map_err(|e| VaultError::io(e, target))
    }
}

/// Streams one file into a per-file container, deflating when the name says
/// so. The target is only replaced once the whole stream committed.
pub fn write_container(target: &Path, src: &mut dyn Read) -> Result<u64, VaultError> {
    let compress = is_gzip_name(&target.to_string_lossy());
    let mut out = DurableFile::create(target).map_err(|e| VaultError::io(e, target))?;
    let written = if compress {
        let mut gz = GzEncoder::new(&mut out, Compression::default());
        let n = io::copy(src, &mut gz).map_err(|e| VaultError::io(e, target))?;
        gz.finish().map_err(|e| VaultError::io(e, target))?;
        n
    } else {
        io::copy(src, &mut out).map_err(|e| VaultError::io(e, target))?
    };
    out.commit().map_err(|e| VaultError::io(e, target))?;
    Ok(written)
}

/// Opens a per-file container for reading, gunzipping when the name says so.
pub fn open_container(path: &Path) -> Result<Box<dyn Read>, VaultError> {
    let file = File::open(path).map_err(|e| VaultError::io(e, path))?;
    if is_gzip_name(&path.to_string_lossy()) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Appends archive names, one per line, to the deferred-removal list. The
/// list accumulates across runs and is consumed externally.
pub fn append_removal_list(path: &Path, names: &[&str]) -> Result<(), VaultError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| VaultError::io(e, path))?;
    for name in names {
        writeln!(file, "{name}").map_err(|e| VaultError::io(e, path))?;
    }
    Ok(())
}
