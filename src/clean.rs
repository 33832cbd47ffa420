//! Age-based cleanup of scratch directories.
//!
//! Deletes files that have not been touched (modification and access time)
//! within the configured age, then removes directories that became empty.
//! The root directory itself is never removed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::backup::rel_path;
use crate::filter::PathFilter;
use crate::safeio::{AllowAll, ConfirmGate, SafeIo};
use crate::VaultError;

pub struct CleanOptions {
    /// Files untouched for at least this long are deleted.
    pub max_age: Duration,
    /// Exclude patterns applied to relative paths.
    pub excludes: Vec<String>,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::days(7),
            excludes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub deleted_files: u64,
    pub deleted_dirs: u64,
    pub bytes_freed: u64,
    pub failed: u64,
}

pub struct CleanEngine {
    target: PathBuf,
    options: CleanOptions,
    safe: SafeIo,
    gate: Arc<dyn ConfirmGate>,
}

impl CleanEngine {
    pub fn new(target: &Path, options: CleanOptions) -> Self {
        Self {
            target: target.to_path_buf(),
            options,
            safe: SafeIo::default(),
            gate: Arc::new(AllowAll),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConfirmGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn run(&self) -> Result<CleanReport, VaultError> {
        if !self.target.is_dir() {
            return Err(VaultError::SourceMissing(self.target.clone()));
        }
        let filter = PathFilter::new(&self.options.excludes)?;
        let cutoff = Utc::now() - self.options.max_age;

        let mut report = CleanReport::default();
        self.clean_dir(&self.target, &filter, cutoff, &mut report)?;
        info!(
            files = report.deleted_files,
            dirs = report.deleted_dirs,
            failed = report.failed,
            "clean finished"
        );
        Ok(report)
    }

    /// Cleans one directory level; returns whether it ended up empty. Any
    /// failure or kept entry marks the directory non-empty.
    fn clean_dir(
        &self,
        dir: &Path,
        filter: &PathFilter,
        cutoff: DateTime<Utc>,
        report: &mut CleanReport,
    ) -> Result<bool, VaultError> {
        let mut empty = true;
        let items = match fs::read_dir(dir) {
            Ok(items) => items,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "directory not readable, left alone");
                report.failed += 1;
                return Ok(false);
            }
        };

        for item in items {
            let entry = match item {
                Ok(e) => e,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "entry not readable, left alone");
                    report.failed += 1;
                    empty = false;
                    continue;
                }
            };
            let path = entry.path();
            if filter.is_match(&rel_path(&self.target, &path)) {
                empty = false;
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => {
                    empty = false;
                    continue;
                }
            };
            if file_type.is_symlink() {
                empty = false;
                continue;
            }

            if file_type.is_dir() {
                if self.clean_dir(&path, filter, cutoff, report)? {
                    if self.gate.confirm(&format!("remove directory '{}'", path.display()))
                        && fs::remove_dir(&path).is_ok()
                    {
                        report.deleted_dirs += 1;
                        continue;
                    }
                }
                empty = false;
                continue;
            }

            match entry.metadata() {
                Ok(meta) if is_expired(&meta, cutoff) => {
                    if !self
                        .gate
                        .confirm(&format!("delete file '{}'", path.display()))
                    {
                        empty = false;
                        continue;
                    }
                    match self.safe.remove_file(&path) {
                        Ok(()) => {
                            report.deleted_files += 1;
                            report.bytes_freed += meta.len();
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "delete failed");
                            report.failed += 1;
                            empty = false;
                        }
                    }
                }
                _ => empty = false,
            }
        }
        Ok(empty)
    }
}

/// A file is expired when both its modification and access time are older
/// than the cutoff. Either timestamp missing keeps the file.
fn is_expired(meta: &fs::Metadata, cutoff: DateTime<Utc>) -> bool {
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    let accessed = meta.accessed().ok().map(DateTime::<Utc>::from);
    match (modified, accessed) {
        (Some(m), Some(a)) => m < cutoff && a < cutoff,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn age(path: &Path, days: i64) {
        let then = FileTime::from_unix_time(
            (Utc::now() - Duration::days(days)).timestamp(),
            0,
        );
        filetime::set_file_times(path, then, then).unwrap();
    }

    #[test]
    fn old_files_go_fresh_files_stay() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.log");
        let fresh = dir.path().join("fresh.log");
        fs::write(&old, b"old").unwrap();
        fs::write(&fresh, b"fresh").unwrap();
        age(&old, 30);

        let report = CleanEngine::new(dir.path(), CleanOptions::default())
            .run()
            .unwrap();

        assert_eq!(report.deleted_files, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn emptied_directories_are_removed() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("a/b");
        fs::create_dir_all(&sub).unwrap();
        let file = sub.join("old.tmp");
        fs::write(&file, b"x").unwrap();
        age(&file, 30);

        let report = CleanEngine::new(dir.path(), CleanOptions::default())
            .run()
            .unwrap();

        assert_eq!(report.deleted_files, 1);
        assert_eq!(report.deleted_dirs, 2);
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn excluded_files_survive_any_age() {
        let dir = TempDir::new().unwrap();
        let keep = dir.path().join("keep.cfg");
        fs::write(&keep, b"x").unwrap();
        age(&keep, 365);

        let options = CleanOptions {
            excludes: vec!["*.cfg".to_string()],
            ..CleanOptions::default()
        };
        let report = CleanEngine::new(dir.path(), options).run().unwrap();

        assert_eq!(report.deleted_files, 0);
        assert!(keep.exists());
    }
}
