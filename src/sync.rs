//! # Mirrored Directory Sync
//!
//! One-way mirror of a source tree onto a target tree. A background producer
//! thread diffs the two trees depth-first and queues actions; the calling
//! thread applies them strictly in order. The queue is unbounded so the
//! scanner never blocks; the consumer polls with a short timeout so a
//! cancellation request is observed promptly even while the queue is empty.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use filetime::FileTime;
use tracing::{info, warn};

use crate::backup::rel_path;
use crate::filter::PathFilter;
use crate::index::same_file_time;
use crate::progress::{NullSink, ProgressSink, TransferCounters};
use crate::VaultError;

/// One unit of work queued by the scanner.
pub enum SyncAction {
    /// Copy a source file over its target path.
    Copy { source: PathBuf, target: PathBuf },
    /// Remove a target file or directory that has no source counterpart.
    Delete(PathBuf),
    /// Informational message, applied in queue order like everything else.
    Log(String),
}

#[derive(Default)]
pub struct SyncOptions {
    /// Exclude patterns applied to relative paths on both sides.
    pub excludes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub copied: u64,
    pub deleted: u64,
    pub bytes_copied: u64,
    pub failed: u64,
}

pub struct SyncPipeline {
    source: PathBuf,
    target: PathBuf,
    options: SyncOptions,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl SyncPipeline {
    pub fn new(source: &Path, target: &Path, options: SyncOptions) -> Self {
        Self {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options,
            stop: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shared cancellation flag. Setting it stops the scanner at its next
    /// step; already queued actions still complete.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs the pipeline to completion (or until cancelled). A scanner
    /// failure, a missing source root included, is reported only after every
    /// queued action has been applied.
    pub fn run(&self) -> Result<SyncReport, VaultError> {
        let filter = PathFilter::new(&self.options.excludes)?;
        let (tx, rx) = unbounded::<SyncAction>();

        let mut report = SyncReport::default();
        let counters = TransferCounters::default();

        let scan_result = thread::scope(|s| {
            let producer = s.spawn({
                let filter = &filter;
                move || {
                    if !self.source.is_dir() {
                        return Err(VaultError::SourceMissing(self.source.clone()));
                    }
                    self.scan_dir(&self.source, &self.target, filter, &tx)
                }
            });

            loop {
                if self.stop.load(Ordering::Relaxed) {
                    // drain what the scanner already queued, then stop
                    while let Ok(action) = rx.try_recv() {
                        self.apply(action, &counters, &mut report);
                    }
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(action) => self.apply(action, &counters, &mut report),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            producer
                .join()
                .unwrap_or_else(|_| Err(VaultError::Aborted(String::from("scan thread panicked"))))
        });
        scan_result.map_err(|e| VaultError::ScanFailed(Box::new(e)))?;

        report.bytes_copied = counters.bytes();
        info!(
            copied = report.copied,
            deleted = report.deleted,
            failed = report.failed,
            "sync finished"
        );
        Ok(report)
    }

    /// Depth-first diff of one directory level. Matched target children are
    /// consumed; whatever is left over afterwards gets a Delete action.
    fn scan_dir(
        &self,
        src: &Path,
        dst: &Path,
        filter: &PathFilter,
        tx: &Sender<SyncAction>,
    ) -> Result<(), VaultError> {
        if self.stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        let items = match fs::read_dir(src) {
            Ok(items) => items,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %src.display(), error = %e, "subtree not readable, treated as empty");
                return Ok(());
            }
            Err(e) => return Err(VaultError::io(e, src)),
        };
        let mut sources: Vec<(String, PathBuf, fs::FileType)> = Vec::new();
        for item in items {
            let entry = item.map_err(|e| VaultError::io(e, src))?;
            let file_type = entry.file_type().map_err(|e| VaultError::io(e, src))?;
            sources.push((
                entry.file_name().to_string_lossy().into_owned(),
                entry.path(),
                file_type,
            ));
        }
        sources.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

        let mut targets: BTreeMap<String, (PathBuf, fs::FileType)> = BTreeMap::new();
        match fs::read_dir(dst) {
            Ok(items) => {
                for item in items {
                    let entry = item.map_err(|e| VaultError::io(e, dst))?;
                    let file_type = entry.file_type().map_err(|e| VaultError::io(e, dst))?;
                    targets.insert(
                        entry.file_name().to_string_lossy().to_lowercase(),
                        (entry.path(), file_type),
                    );
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(VaultError::io(e, dst)),
        }

        for (name, src_path, file_type) in sources {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            // consuming the match protects excluded/symlinked paths from the
            // leftover deletion below
            let matched = targets.remove(&name.to_lowercase());
            if filter.is_match(&rel_path(&self.source, &src_path)) {
                continue;
            }
            if file_type.is_symlink() {
                continue;
            }

            // a match with different casing keeps the target's own path, or
            // the mirror would grow a second copy on case-sensitive systems
            let dst_path = dst.join(&name);
            if file_type.is_dir() {
                let next = match &matched {
                    Some((existing, existing_type)) if existing_type.is_dir() => existing.clone(),
                    Some((existing, _)) => {
                        send(tx, SyncAction::Delete(existing.clone()))?;
                        dst_path
                    }
                    None => dst_path,
                };
                self.scan_dir(&src_path, &next, filter, tx)?;
            } else {
                match matched {
                    Some((existing, existing_type)) if existing_type.is_symlink() => {
                        send(
                            tx,
                            SyncAction::Log(format!(
                                "target '{}' is a symlink, left alone",
                                existing.display()
                            )),
                        )?;
                    }
                    Some((existing, existing_type)) if existing_type.is_dir() => {
                        send(tx, SyncAction::Delete(existing))?;
                        send(
                            tx,
                            SyncAction::Copy {
                                source: src_path,
                                target: dst_path,
                            },
                        )?;
                    }
                    Some((existing, _)) => {
                        if !files_equal(&src_path, &existing) {
                            send(
                                tx,
                                SyncAction::Copy {
                                    source: src_path,
                                    target: existing,
                                },
                            )?;
                        }
                    }
                    None => send(
                        tx,
                        SyncAction::Copy {
                            source: src_path,
                            target: dst_path,
                        },
                    )?,
                }
            }
        }

        for (_, (path, file_type)) in targets {
            if file_type.is_symlink() {
                continue;
            }
            if filter.is_match(&rel_path(&self.target, &path)) {
                continue;
            }
            send(tx, SyncAction::Delete(path))?;
        }
        Ok(())
    }

    /// Applies one queued action. Failures on a single file are logged and
    /// counted, never fatal.
    fn apply(&self, action: SyncAction, counters: &TransferCounters, report: &mut SyncReport) {
        match action {
            SyncAction::Copy { source, target } => match copy_file(&source, &target) {
                Ok(bytes) => {
                    report.copied += 1;
                    counters.add_file(bytes);
                    self.sink.status("sync", counters.bytes(), 0);
                }
                Err(err) => {
                    warn!(source = %source.display(), error = %err, "copy failed");
                    report.failed += 1;
                }
            },
            SyncAction::Delete(path) => match remove_item(&path) {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "delete failed");
                    report.failed += 1;
                }
            },
            SyncAction::Log(message) => info!("{message}"),
        }
    }
}

fn send(tx: &Sender<SyncAction>, action: SyncAction) -> Result<(), VaultError> {
    tx.send(action)
        .map_err(|_| VaultError::Aborted(String::from("action queue closed")))
}

fn stamp(time: io::Result<SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

/// Metadata-level equality: exact length, modification and access time within
/// one second. A timestamp the filesystem cannot report never forces a copy.
fn files_equal(a: &Path, b: &Path) -> bool {
    let (ma, mb) = match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        _ => return false,
    };
    if ma.len() != mb.len() {
        return false;
    }
    for (ta, tb) in [
        (stamp(ma.modified()), stamp(mb.modified())),
        (stamp(ma.accessed()), stamp(mb.accessed())),
    ] {
        if let (Some(ta), Some(tb)) = (ta, tb) {
            if !same_file_time(ta, tb) {
                return false;
            }
        }
    }
    true
}

/// Copies one file and carries over timestamps and permissions. An existing
/// read-only target is made writable first.
fn copy_file(source: &Path, target: &Path) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Ok(meta) = target.metadata() {
        if meta.permissions().readonly() {
            let mut perms = meta.permissions();
            perms.set_readonly(false);
            fs::set_permissions(target, perms)?;
        }
    }

    let bytes = {
        let mut src = fs::File::open(source)?;
        let mut dst = fs::File::create(target)?;
        io::copy(&mut src, &mut dst)?
    };

    // metadata re-read after the copy so the recorded access time reflects
    // the read we just did; keeps the next compare pass quiet
    let meta = fs::metadata(source)?;
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(target, atime, mtime)?;
    fs::set_permissions(target, meta.permissions())?;
    Ok(bytes)
}

/// Removes a file or a whole directory, innermost entries first, clearing
/// read-only bits that would block the removal. Symlinks are left in place.
fn remove_item(path: &Path) -> io::Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for item in fs::read_dir(path)? {
            remove_item(&item?.path())?;
        }
        return fs::remove_dir(path);
    }
    if meta.permissions().readonly() {
        let mut perms = meta.permissions();
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    fs::remove_file(path)
}
