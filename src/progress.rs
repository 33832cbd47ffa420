//! Progress reporting hooks.
//!
//! The engines report coarse progress through a [`ProgressSink`] so the CLI,
//! a test, or an embedding application can render it however they like. The
//! default sink discards everything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Receives progress updates from a running engine. `position`/`maximum` are
/// in operation-defined units (files for scans, bytes for transfers);
/// `maximum` is zero while the total is still unknown.
pub trait ProgressSink: Send + Sync {
    fn status(&self, operation: &str, position: u64, maximum: u64);
}

/// Discards all progress updates.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn status(&self, _operation: &str, _position: u64, _maximum: u64) {}
}

/// Shared byte/file counters for a transfer, safe to bump from worker
/// threads while another thread reads them for display.
#[derive(Default)]
pub struct TransferCounters {
    pub files: AtomicU64,
    pub bytes: AtomicU64,
}

impl TransferCounters {
    pub fn add_file(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Formats a byte count with a binary-unit suffix.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Mean throughput since `start`, rendered for log lines.
pub fn format_throughput(bytes: u64, start: Instant) -> String {
    let secs = start.elapsed().as_secs_f64();
    if secs <= f64::EPSILON {
        return String::from("-");
    }
    format!("{}/s", format_bytes((bytes as f64 / secs) as u64))
}
