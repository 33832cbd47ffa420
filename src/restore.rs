//! # Backup Restore Engine
//!
//! Rebuilds files from a backup target directory. The index is the source of
//! truth: it names each file's container, its exact length and the metadata
//! to reapply. Containers are visited once each; per-file failures skip that
//! file so an interrupted restore can simply be rerun.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::archive::{clean_entry_name, is_direct_container, open_container, INDEX_FILE_NAME};
use crate::filter::PathFilter;
use crate::index::{FileIndex, IndexEntry, ATTR_READ_ONLY};
use crate::progress::{NullSink, ProgressSink, TransferCounters};
use crate::safeio::{copy_with_progress, SafeIo};
use crate::VaultError;

#[derive(Default)]
pub struct RestoreOptions {
    /// Replace existing files; when false an existing target is skipped with
    /// a warning so a rerun resumes where the last one stopped.
    pub overwrite: bool,
    /// Include patterns; empty restores everything.
    pub filter: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: u64,
    pub skipped: u64,
    pub bytes_written: u64,
}

pub struct RestoreEngine {
    source: PathBuf,
    target: PathBuf,
    options: RestoreOptions,
    safe: SafeIo,
    sink: Arc<dyn ProgressSink>,
}

impl RestoreEngine {
    pub fn new(source: &Path, target: &Path, options: RestoreOptions) -> Self {
        Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options,
            safe: SafeIo::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn run(&self) -> Result<RestoreReport, VaultError> {
        let mut index = FileIndex::load(&self.source.join(INDEX_FILE_NAME))?;
        if index.is_empty() {
            warn!(source = %self.source.display(), "backup index is empty, nothing to restore");
            return Ok(RestoreReport::default());
        }

        let filter = PathFilter::new(&self.options.filter)?;
        if !filter.is_empty() {
            index.retain(|e| filter.is_match(&e.relative_path));
        }
        let total_bytes: u64 = index.iter().map(|e| e.length).sum();
        info!(files = index.len(), "restore planned");

        // Visit each container once, in deterministic name order.
        let mut groups: BTreeMap<String, Vec<&IndexEntry>> = BTreeMap::new();
        for entry in index.iter() {
            groups
                .entry(entry.archive_name.to_lowercase())
                .or_default()
                .push(entry);
        }

        let counters = TransferCounters::default();
        let mut report = RestoreReport::default();
        for (name_lower, entries) in &groups {
            let archive_path = self.source.join(&entries[0].archive_name);
            if name_lower.is_empty() || !archive_path.exists() {
                warn!(
                    archive = %entries[0].archive_name,
                    files = entries.len(),
                    "container missing, files skipped"
                );
                report.skipped += entries.len() as u64;
                continue;
            }

            if is_direct_container(name_lower) {
                for entry in entries {
                    let mut reader = open_container(&archive_path)?;
                    self.restore_one(entry, reader.as_mut(), &counters, total_bytes, &mut report)?;
                }
            } else {
                self.restore_from_zip(
                    &archive_path,
                    entries,
                    &index,
                    &filter,
                    &counters,
                    total_bytes,
                    &mut report,
                )?;
            }
        }

        report.bytes_written = counters.bytes();
        info!(
            restored = report.restored,
            skipped = report.skipped,
            "restore finished"
        );
        Ok(report)
    }

    /// Walks a shared zip's physical entries, restoring each one whose index
    /// row points at this archive. Index rows the zip never delivers are
    /// reported as skipped.
    fn restore_from_zip(
        &self,
        archive_path: &Path,
        entries: &[&IndexEntry],
        index: &FileIndex,
        filter: &PathFilter,
        counters: &TransferCounters,
        total_bytes: u64,
        report: &mut RestoreReport,
    ) -> Result<(), VaultError> {
        let file = File::open(archive_path).map_err(|e| VaultError::io(e, archive_path))?;
        let mut zip = ZipArchive::new(file)?;
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut pending: BTreeMap<String, &IndexEntry> = entries
            .iter()
            .map(|e| (e.relative_path.to_lowercase(), *e))
            .collect();

        for i in 0..zip.len() {
            let mut packed = zip.by_index(i)?;
            if packed.is_dir() {
                continue;
            }
            let name = clean_entry_name(packed.name());
            let entry = match index.get(&name) {
                Some(e) if e.archive_name.to_lowercase() == archive_name => e,
                Some(_) => continue, // newer copy lives in another container
                None => {
                    if filter.is_empty() || filter.is_match(&name) {
                        warn!(entry = %name, archive = %archive_name, "archive entry has no index row, skipped");
                        report.skipped += 1;
                    }
                    continue;
                }
            };
            self.restore_one(entry, &mut packed, counters, total_bytes, report)?;
            pending.remove(&name.to_lowercase());
        }

        for entry in pending.values() {
            warn!(
                path = %entry.relative_path,
                archive = %archive_name,
                "entry not found in archive, file skipped"
            );
            report.skipped += 1;
        }
        Ok(())
    }

    /// Streams one file's content to its target path and reapplies the
    /// recorded metadata.
    fn restore_one(
        &self,
        entry: &IndexEntry,
        content: &mut dyn Read,
        counters: &TransferCounters,
        total_bytes: u64,
        report: &mut RestoreReport,
    ) -> Result<(), VaultError> {
        let dest = self.target.join(&entry.relative_path);
        if let Some(parent) = dest.parent() {
            self.safe.create_dir_all(parent)?;
        }

        let open = if self.options.overwrite {
            File::create(&dest)
        } else {
            OpenOptions::new().write(true).create_new(true).open(&dest)
        };
        let mut out = match open {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %dest.display(), "target exists, file skipped");
                report.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(VaultError::io(e, &dest)),
        };

        // Containers may carry trailing bytes (stored copies are written
        // whole); the index length is authoritative.
        copy_with_progress(&mut content.take(entry.length), &mut out, |chunk| {
            counters.add_bytes(chunk);
            self.sink.status("restore", counters.bytes(), total_bytes);
        })
        .map_err(|e| VaultError::io(e, &dest))?;
        out.set_len(entry.length).map_err(|e| VaultError::io(e, &dest))?;
        out.flush().map_err(|e| VaultError::io(e, &dest))?;
        drop(out);

        let mtime = FileTime::from_system_time(entry.modified_at.into());
        let atime = FileTime::from_system_time(entry.accessed_at.into());
        filetime::set_file_times(&dest, atime, mtime).map_err(|e| VaultError::io(e, &dest))?;
        if entry.attributes & ATTR_READ_ONLY != 0 {
            let mut perms = dest
                .metadata()
                .map_err(|e| VaultError::io(e, &dest))?
                .permissions();
            perms.set_readonly(true);
            std::fs::set_permissions(&dest, perms).map_err(|e| VaultError::io(e, &dest))?;
        }

        report.restored += 1;
        Ok(())
    }
}
