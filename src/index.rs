//! The durable file index.
//!
//! Maps a case-insensitive relative path to the metadata and archive location
//! recorded by the last successful backup run. The on-disk format is one
//! semicolon-delimited CSV row per entry, column order
//! `(relativePath, createdAt, lastAccessedAt, lastModifiedAt, length,
//! attributes, archiveName)`, timestamps in RFC 3339, the whole file gzipped
//! when its name ends in `.gz`. This exact shape is a compatibility contract;
//! do not reorder columns.

use std::collections::btree_map::{self, BTreeMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::{read::GzDecoder, Compression};
use serde::{Deserialize, Serialize};

use crate::archive::is_gzip_name;
use crate::safeio::DurableFile;
use crate::VaultError;

/// Read-only bit of the persisted attribute bitmask.
pub const ATTR_READ_ONLY: u32 = 0x1;
/// Hidden bit (dotfiles on Unix).
pub const ATTR_HIDDEN: u32 = 0x2;
/// Directory bit; never set for index entries but part of the format.
pub const ATTR_DIRECTORY: u32 = 0x10;

/// Per-run change state of an index entry. Recomputed on every diff pass,
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileState {
    /// Not visited by the current diff pass: present in the index but absent
    /// from the live tree, a deletion candidate.
    #[default]
    None,
    /// Live metadata matches the recorded metadata.
    Unmodified,
    /// New file, or live metadata differs.
    Modified,
}

/// A single index row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub relative_path: String,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub length: u64,
    pub attributes: u32,
    /// Name of the container currently holding the latest content; empty only
    /// for entries that have never been written.
    pub archive_name: String,
    #[serde(skip)]
    pub state: FileState,
}

/// Metadata snapshot of one file in the live source tree.
#[derive(Debug, Clone)]
pub struct LiveFile {
    pub relative_path: String,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub length: u64,
    pub attributes: u32,
}

impl LiveFile {
    /// Builds a snapshot from filesystem metadata. A missing creation time
    /// (not all filesystems track it) falls back to the modification time.
    pub fn from_metadata(relative_path: String, path: &Path, meta: &fs::Metadata) -> Self {
        let modified = system_time_or_epoch(meta.modified());
        Self {
            relative_path,
            created_at: meta.created().map(DateTime::<Utc>::from).unwrap_or(modified),
            accessed_at: system_time_or_epoch(meta.accessed()),
            modified_at: modified,
            length: meta.len(),
            attributes: attributes_of(path, meta),
        }
    }
}

fn system_time_or_epoch(t: std::io::Result<SystemTime>) -> DateTime<Utc> {
    t.map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
}

/// Derives the persisted attribute bitmask from filesystem metadata.
pub fn attributes_of(path: &Path, meta: &fs::Metadata) -> u32 {
    let mut attrs = 0;
    if meta.permissions().readonly() {
        attrs |= ATTR_READ_ONLY;
    }
    if path
        .file_name()
        .map_or(false, |n| n.to_string_lossy().starts_with('.'))
    {
        attrs |= ATTR_HIDDEN;
    }
    if meta.is_dir() {
        attrs |= ATTR_DIRECTORY;
    }
    attrs
}

/// Timestamps compare equal when they differ by less than one whole second.
/// Filesystems truncate timestamps at varying granularity; anything finer
/// would flag every file as modified after a copy.
pub fn same_file_time(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds() == 0
}

impl IndexEntry {
    fn from_live(live: &LiveFile) -> Self {
        Self {
            relative_path: live.relative_path.clone(),
            created_at: live.created_at,
            accessed_at: live.accessed_at,
            modified_at: live.modified_at,
            length: live.length,
            attributes: live.attributes,
            archive_name: String::new(),
            state: FileState::Modified,
        }
    }

    /// Change-detection equality: exact length and attributes, modification
    /// time within one second. Creation/access time are deliberately not part
    /// of the comparison.
    pub fn matches(&self, live: &LiveFile) -> bool {
        self.length == live.length
            && self.attributes == live.attributes
            && same_file_time(self.modified_at, live.modified_at)
    }

    /// Overwrites the recorded metadata with the live snapshot and marks the
    /// entry modified. The archive assignment is left alone.
    pub fn update(&mut self, live: &LiveFile) {
        self.created_at = live.created_at;
        self.accessed_at = live.accessed_at;
        self.modified_at = live.modified_at;
        self.length = live.length;
        self.attributes = live.attributes;
        self.state = FileState::Modified;
    }
}

/// The index table: lower-cased relative path → entry.
#[derive(Default)]
pub struct FileIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an index file. A file that does not exist yields an empty index;
    /// a file that exists but cannot be parsed is fatal.
    pub fn load(path: &Path) -> Result<Self, VaultError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(VaultError::io(e, path)),
        };

        let reader: Box<dyn Read> = if is_gzip_name(&path.to_string_lossy()) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut index = Self::new();
        let mut csv = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_reader(reader);
        for row in csv.deserialize::<IndexEntry>() {
            let entry = row.map_err(|e| VaultError::IndexCorrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            index
                .entries
                .insert(entry.relative_path.to_lowercase(), entry);
        }
        Ok(index)
    }

    /// Persists every entry through a durable writer; the previous index file
    /// is replaced only after the new one is fully written.
    pub fn save(&self, path: &Path) -> Result<(), VaultError> {
        let mut out = DurableFile::create(path).map_err(|e| VaultError::io(e, path))?;
        if is_gzip_name(&path.to_string_lossy()) {
            let mut gz = GzEncoder::new(&mut out, Compression::default());
            self.write_rows(&mut gz, path)?;
            gz.finish().map_err(|e| VaultError::io(e, path))?;
        } else {
            self.write_rows(&mut out, path)?;
        }
        out.commit().map_err(|e| VaultError::io(e, path))
    }

    fn write_rows<W: Write>(&self, writer: W, path: &Path) -> Result<(), VaultError> {
        let mut csv = csv::WriterBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .from_writer(writer);
        for entry in self.entries.values() {
            csv.serialize(entry).map_err(|e| {
                VaultError::io(
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                    path,
                )
            })?;
        }
        csv.flush().map_err(|e| VaultError::io(e, path))?;
        Ok(())
    }

    /// Diffs one live file against the table, updating it in place, and
    /// returns the affected entry with its new state.
    pub fn diff(&mut self, live: &LiveFile) -> &mut IndexEntry {
        match self.entries.entry(live.relative_path.to_lowercase()) {
            btree_map::Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.matches(live) {
                    entry.state = FileState::Unmodified;
                } else {
                    entry.update(live);
                }
                entry
            }
            btree_map::Entry::Vacant(slot) => slot.insert(IndexEntry::from_live(live)),
        }
    }

    /// Removes a confirmed deletion.
    pub fn remove(&mut self, relative_path: &str) {
        self.entries.remove(&relative_path.to_lowercase());
    }

    pub fn get(&self, relative_path: &str) -> Option<&IndexEntry> {
        self.entries.get(&relative_path.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IndexEntry> {
        self.entries.values_mut()
    }

    /// Drops every entry the predicate rejects; used by the restore filter.
    pub fn retain(&mut self, mut keep: impl FnMut(&IndexEntry) -> bool) {
        self.entries.retain(|_, e| keep(e));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn live(path: &str, len: u64, secs: i64) -> LiveFile {
        LiveFile {
            relative_path: path.to_string(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            accessed_at: Utc.timestamp_opt(secs, 0).unwrap(),
            modified_at: Utc.timestamp_opt(secs, 0).unwrap(),
            length: len,
            attributes: 0,
        }
    }

    #[test]
    fn new_file_is_modified_with_no_archive() {
        let mut index = FileIndex::new();
        let entry = index.diff(&live("a.txt", 10, 1_700_000_000));
        assert_eq!(entry.state, FileState::Modified);
        assert!(entry.archive_name.is_empty());
    }

    #[test]
    fn unchanged_file_is_unmodified() {
        let mut index = FileIndex::new();
        index.diff(&live("a.txt", 10, 1_700_000_000));
        let entry = index.diff(&live("a.txt", 10, 1_700_000_000));
        assert_eq!(entry.state, FileState::Unmodified);
    }

    #[test]
    fn length_change_is_detected() {
        let mut index = FileIndex::new();
        index.diff(&live("a.txt", 10, 1_700_000_000));
        let entry = index.diff(&live("a.txt", 12, 1_700_000_000));
        assert_eq!(entry.state, FileState::Modified);
        assert_eq!(entry.length, 12);
    }

    #[test]
    fn mtime_change_is_detected() {
        let mut index = FileIndex::new();
        index.diff(&live("a.txt", 10, 1_700_000_000));
        let entry = index.diff(&live("a.txt", 10, 1_700_000_002));
        assert_eq!(entry.state, FileState::Modified);
    }

    #[test]
    fn sub_second_mtime_drift_is_ignored() {
        let a = Utc.timestamp_opt(1_700_000_000, 400_000_000).unwrap();
        let b = Utc.timestamp_opt(1_700_000_000, 900_000_000).unwrap();
        assert!(same_file_time(a, b));
        let c = Utc.timestamp_opt(1_700_000_001, 500_000_000).unwrap();
        assert!(!same_file_time(a, c));
    }

    #[test]
    fn creation_time_is_not_part_of_equality() {
        let mut index = FileIndex::new();
        index.diff(&live("a.txt", 10, 1_700_000_000));
        let mut probe = live("a.txt", 10, 1_700_000_000);
        probe.created_at = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        probe.accessed_at = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let entry = index.diff(&probe);
        assert_eq!(entry.state, FileState::Unmodified);
    }

    #[test]
    fn paths_are_case_insensitive() {
        let mut index = FileIndex::new();
        index.diff(&live("Docs/Readme.MD", 5, 1_700_000_000));
        assert!(index.get("docs/readme.md").is_some());
        let entry = index.diff(&live("DOCS/README.md", 5, 1_700_000_000));
        assert_eq!(entry.state, FileState::Unmodified);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.txt.gz");

        let mut index = FileIndex::new();
        let entry = index.diff(&live("a.txt", 10, 1_700_000_000));
        entry.archive_name = "cafe.zip".to_string();
        index.diff(&live("b/c.bin", 99, 1_700_000_500));
        index.save(&path).unwrap();

        let loaded = FileIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let a = loaded.get("a.txt").unwrap();
        assert_eq!(a.length, 10);
        assert_eq!(a.archive_name, "cafe.zip");
        // transient state never round-trips
        assert_eq!(a.state, FileState::None);
    }

    #[test]
    fn missing_index_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::load(&dir.path().join("index.txt.gz")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn malformed_row_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.txt");
        fs::write(&path, "only;three;columns\n").unwrap();
        let err = FileIndex::load(&path).err().expect("load must fail");
        assert!(matches!(err, VaultError::IndexCorrupt { .. }));
    }
}
