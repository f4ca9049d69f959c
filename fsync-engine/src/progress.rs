//! Observable transfer progress.
//!
//! Sessions update a shared [`ProgressTracker`]; frontends poll
//! [`ProgressTracker::snapshot`] to render whatever they like. Counters are
//! monotonic within one session run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Point-in-time view of a session's transfer progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub files_total: u64,
    pub files_done: u64,
    pub bytes_expected: u64,
    /// Literal bytes put on the wire.
    pub bytes_sent: u64,
    /// Bytes satisfied from existing destination content.
    pub bytes_reused: u64,
    pub current_path: Option<String>,
}

#[derive(Default)]
pub struct ProgressTracker {
    files_total: AtomicU64,
    files_done: AtomicU64,
    bytes_expected: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_reused: AtomicU64,
    current_path: Mutex<Option<String>>,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(&self, files_total: u64, bytes_expected: u64) {
        self.files_total.store(files_total, Ordering::Relaxed);
        self.bytes_expected.store(bytes_expected, Ordering::Relaxed);
        self.files_done.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_reused.store(0, Ordering::Relaxed);
    }

    pub fn start_file(&self, path: &str) {
        if let Ok(mut current) = self.current_path.lock() {
            *current = Some(path.to_string());
        }
    }

    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_reused(&self, bytes: u64) {
        self.bytes_reused.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn finish_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.current_path.lock() {
            *current = None;
        }
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            files_total: self.files_total.load(Ordering::Relaxed),
            files_done: self.files_done.load(Ordering::Relaxed),
            bytes_expected: self.bytes_expected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_reused: self.bytes_reused.load(Ordering::Relaxed),
            current_path: self.current_path.lock().ok().and_then(|c| c.clone()),
        }
    }
}
