//! # Incremental Backup Engine
//!
//! Drives one backup run: load the recorded index, diff it against the live
//! source tree, stream every changed file into this run's containers, persist
//! the updated index, then garbage-collect archives nothing references any
//! more. The run is restart-safe: all output goes through durable writers,
//! and the index is only replaced after the run's archives are committed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::archive::{
    append_removal_list, write_container, ArchivePlanner, RunArchiveWriter, DEFAULT_NO_COMPRESS,
    DEFAULT_SIZE_THRESHOLD, INDEX_FILE_NAME, REMOVAL_LIST_NAME,
};
use crate::filter::PathFilter;
use crate::index::{FileIndex, FileState, LiveFile};
use crate::progress::{format_throughput, NullSink, ProgressSink, TransferCounters};
use crate::safeio::{AllowAll, ConfirmGate, SafeIo};
use crate::VaultError;

/// Tunables for one backup run.
pub struct BackupOptions {
    /// Alternate index location. When set, archive deletions are deferred to
    /// the removal list instead of executed.
    pub shadow_index: Option<PathBuf>,
    /// Re-pack every file regardless of recorded metadata.
    pub force: bool,
    /// Exclude patterns applied to relative paths.
    pub excludes: Vec<String>,
    /// Files at or above this size get their own container.
    pub size_threshold: u64,
    /// Extensions stored without compression.
    pub no_compress: Vec<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            shadow_index: None,
            force: false,
            excludes: Vec::new(),
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            no_compress: DEFAULT_NO_COMPRESS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Outcome counters of a completed run.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub modified: u64,
    pub unmodified: u64,
    pub removed: u64,
    pub bytes_written: u64,
    pub archives_collected: u64,
}

pub struct BackupEngine {
    source: PathBuf,
    target: PathBuf,
    options: BackupOptions,
    safe: SafeIo,
    sink: Arc<dyn ProgressSink>,
    gate: Arc<dyn ConfirmGate>,
}

impl BackupEngine {
    pub fn new(source: &Path, target: &Path, options: BackupOptions) -> Self {
        Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options,
            safe: SafeIo::default(),
            sink: Arc::new(NullSink),
            gate: Arc::new(AllowAll),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConfirmGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Runs the full backup: diff, write, persist, collect.
    pub fn run(&self) -> Result<BackupReport, VaultError> {
        if !self.source.is_dir() {
            return Err(VaultError::SourceMissing(self.source.clone()));
        }
        let started = Instant::now();

        let index_path = match &self.options.shadow_index {
            Some(shadow) => shadow.clone(),
            None => self.target.join(INDEX_FILE_NAME),
        };
        let mut index = FileIndex::load(&index_path)?;
        info!(entries = index.len(), "index loaded");

        self.scan(&mut index)?;

        // Plan pass: assign containers, count references, collect deletions.
        let mut planner = ArchivePlanner::new(
            self.options.size_threshold,
            self.options.no_compress.clone(),
        );
        let mut removals: Vec<String> = Vec::new();
        for entry in index.iter_mut() {
            if entry.state == FileState::Unmodified {
                let archive_gone = self.options.shadow_index.is_none()
                    && (entry.archive_name.is_empty()
                        || !self.target.join(&entry.archive_name).exists());
                if self.options.force || archive_gone {
                    entry.state = FileState::Modified;
                }
            }
            match entry.state {
                FileState::Modified => planner.plan_modified(entry),
                FileState::Unmodified => planner.note_unmodified(entry),
                FileState::None => {
                    planner.note_orphan(entry);
                    removals.push(entry.relative_path.clone());
                }
            }
        }

        let mut report = BackupReport {
            modified: planner.modified,
            unmodified: planner.unmodified,
            ..BackupReport::default()
        };
        if planner.modified == 0 {
            info!(unmodified = report.unmodified, "nothing changed, no output written");
            return Ok(report);
        }

        report.bytes_written = self.write_containers(&index, &planner)?;
        report.removed = removals.len() as u64;

        // Persist: archives are committed above; only now may the index move.
        for path in &removals {
            index.remove(path);
        }
        index.save(&self.target.join(INDEX_FILE_NAME))?;
        if let Some(shadow) = &self.options.shadow_index {
            index.save(shadow)?;
        }

        report.archives_collected = self.collect_garbage(&planner)?;

        info!(
            modified = report.modified,
            unmodified = report.unmodified,
            removed = report.removed,
            throughput = %format_throughput(report.bytes_written, started),
            "backup finished"
        );
        Ok(report)
    }

    /// Diff pass: walks the source depth-first and feeds every regular file
    /// through the index.
    fn scan(&self, index: &mut FileIndex) -> Result<(), VaultError> {
        let filter = PathFilter::new(&self.options.excludes)?;
        let source = self.source.clone();

        let walker = WalkDir::new(&self.source)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| {
                if e.path_is_symlink() {
                    return false;
                }
                match e.path().strip_prefix(&source) {
                    Ok(rel) if !rel.as_os_str().is_empty() => {
                        !filter.is_match(&rel.to_string_lossy())
                    }
                    _ => true,
                }
            });

        let mut seen = 0u64;
        for item in walker {
            let entry = match item {
                Ok(e) => e,
                Err(err) => {
                    let denied = err
                        .io_error()
                        .map_or(false, |e| e.kind() == std::io::ErrorKind::PermissionDenied);
                    if denied {
                        warn!(error = %err, "subtree not readable, treated as empty");
                        continue;
                    }
                    return Err(VaultError::io(err.into(), &self.source));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "metadata unreadable, file skipped");
                    continue;
                }
            };
            let rel = rel_path(&self.source, entry.path());
            index.diff(&LiveFile::from_metadata(rel, entry.path(), &meta));
            seen += 1;
            self.sink.status("scan", seen, 0);
        }
        Ok(())
    }

    /// Write pass: streams every Modified entry into the shared zip or its
    /// own container, in index-iteration order.
    fn write_containers(
        &self,
        index: &FileIndex,
        planner: &ArchivePlanner,
    ) -> Result<u64, VaultError> {
        let mut zip = if planner.zipped > 0 {
            Some(RunArchiveWriter::create(
                &self.target.join(planner.run_archive()),
                self.options.no_compress.clone(),
            )?)
        } else {
            None
        };

        let counters = TransferCounters::default();
        for entry in index.iter().filter(|e| e.state == FileState::Modified) {
            let src_path = self.source.join(&entry.relative_path);
            let mut reader = self.safe.open_read_or_empty(&src_path);
            let written = if entry.archive_name == planner.run_archive() {
                match zip.as_mut() {
                    Some(w) => w.add_entry(entry, reader.as_mut())?,
                    None => 0,
                }
            } else {
                write_container(&self.target.join(&entry.archive_name), reader.as_mut())?
            };
            counters.add_file(written);
            self.sink
                .status("backup", counters.bytes(), planner.total_bytes);
        }

        if let Some(zip) = zip {
            zip.finish()?;
        }
        Ok(counters.bytes())
    }

    /// Deletes (or schedules) every archive that ended the run unreferenced.
    fn collect_garbage(&self, planner: &ArchivePlanner) -> Result<u64, VaultError> {
        let garbage: Vec<&str> = planner.usage().unreferenced().collect();
        if garbage.is_empty() {
            return Ok(0);
        }

        if self.options.shadow_index.is_some() {
            append_removal_list(&self.target.join(REMOVAL_LIST_NAME), &garbage)?;
            return Ok(garbage.len() as u64);
        }

        let mut collected = 0u64;
        for name in garbage {
            if !self.gate.confirm(&format!("delete archive '{name}'")) {
                info!(archive = name, "deletion declined, archive kept");
                continue;
            }
            self.safe.remove_file(&self.target.join(name))?;
            collected += 1;
        }
        Ok(collected)
    }
}

/// Relative path with forward-slash separators, the index's native form.
pub fn rel_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
