//! Retry-capable filesystem wrappers and durable file writes.
//!
//! Every fallible filesystem touch in the engines goes through [`SafeIo`], a
//! small hookable retry loop, instead of an inline try/retry at each call
//! site. Output files are produced through [`DurableFile`], which writes to a
//! randomly named sibling temp file and only replaces the target on an
//! explicit commit, so an interrupted run never leaves a half-written index
//! or archive at the target path.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::warn;

use crate::VaultError;

/// What to do after a failed I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry(Duration),
    /// Give up on this operation but let the caller fall back (reads
    /// substitute an empty stream).
    Skip,
    /// Terminate the run.
    Abort,
}

/// Decides whether a failed filesystem operation is retried.
///
/// Implementations can prompt a user, consult a log, or just count attempts;
/// the engines stay ignorant of the mechanism.
pub trait RetryPolicy: Send + Sync {
    fn on_error(&self, what: &str, attempt: u32, err: &io::Error) -> RetryDecision;
}

/// Default policy: a capped number of attempts with linearly growing delays.
pub struct LinearBackoff {
    pub max_attempts: u32,
    pub step: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            step: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn on_error(&self, _what: &str, attempt: u32, _err: &io::Error) -> RetryDecision {
        if attempt < self.max_attempts {
            RetryDecision::Retry(self.step * attempt)
        } else {
            RetryDecision::Abort
        }
    }
}

/// Consulted before every destructive action (delete, overwrite).
pub trait ConfirmGate: Send + Sync {
    fn confirm(&self, action: &str) -> bool;
}

/// Non-interactive gate that lets everything through.
pub struct AllowAll;

impl ConfirmGate for AllowAll {
    fn confirm(&self, _action: &str) -> bool {
        true
    }
}

/// Filesystem operations wrapped in the retry policy.
#[derive(Clone)]
pub struct SafeIo {
    policy: Arc<dyn RetryPolicy>,
}

impl Default for SafeIo {
    fn default() -> Self {
        Self {
            policy: Arc::new(LinearBackoff::default()),
        }
    }
}

impl SafeIo {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    /// Runs `op` under the retry policy. `what` names the operation for
    /// diagnostics and the policy hook.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> io::Result<T>) -> Result<T, VaultError> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    match self.policy.on_error(what, attempt, &err) {
                        RetryDecision::Retry(delay) => {
                            warn!(what, attempt, error = %err, "I/O failed, retrying");
                            thread::sleep(delay);
                        }
                        RetryDecision::Skip => {
                            return Err(VaultError::Aborted(format!("{what}: {err} (skipped)")))
                        }
                        RetryDecision::Abort => {
                            return Err(VaultError::Aborted(format!("{what}: {err}")))
                        }
                    }
                }
            }
        }
    }

    /// Opens a file for reading under the retry policy.
    pub fn open_read(&self, path: &Path) -> Result<File, VaultError> {
        self.run(&format!("open '{}'", path.display()), || File::open(path))
    }

    /// Opens a file for reading; if retries are exhausted the file is treated
    /// as empty instead of failing the run.
    pub fn open_read_or_empty(&self, path: &Path) -> Box<dyn Read + Send> {
        match self.open_read(path) {
            Ok(file) => Box::new(file),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable file treated as empty");
                Box::new(io::empty())
            }
        }
    }

    /// Deletes a file under the retry policy. A file that is already gone is
    /// not an error.
    pub fn remove_file(&self, path: &Path) -> Result<(), VaultError> {
        self.run(&format!("delete '{}'", path.display()), || {
            match fs::remove_file(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
    }

    /// Creates a directory chain under the retry policy.
    pub fn create_dir_all(&self, path: &Path) -> Result<(), VaultError> {
        self.run(&format!("mkdir '{}'", path.display()), || {
            fs::create_dir_all(path)
        })
    }
}

/// Scoped durable write: all bytes go to a sibling temp file; the target is
/// only touched by `commit`, which atomically replaces it. Dropping the
/// writer without committing discards the temp file.
pub struct DurableFile {
    target: PathBuf,
    temp: NamedTempFile,
}

impl DurableFile {
    /// Opens a durable writer for `target`, creating parent directories as
    /// needed. The temp file lives in the same directory so the final rename
    /// stays on one filesystem.
    pub fn create(target: &Path) -> io::Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let temp = NamedTempFile::new_in(&dir)?;
        Ok(Self {
            target: target.to_path_buf(),
            temp,
        })
    }

    /// Flushes and atomically moves the temp file over the target,
    /// overwriting any existing file.
    pub fn commit(mut self) -> io::Result<()> {
        self.temp.flush()?;
        if self.target.exists() {
            // Windows rename does not replace; mirrors the delete-then-move
            // of interactive tools.
            let _ = fs::remove_file(&self.target);
        }
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        Ok(())
    }

    /// The path the committed file will land at.
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Write for DurableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl Seek for DurableFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.temp.seek(pos)
    }
}

/// Streams `src` into `dst` in fixed chunks, reporting each chunk's size.
/// Returns the total byte count.
pub fn copy_with_progress<R, W, F>(src: &mut R, dst: &mut W, mut on_chunk: F) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
        on_chunk(n as u64);
    }
    Ok(total)
}
