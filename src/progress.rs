//! Progress reporting for pack and unpack passes.
//!
//! Both passes are sequential, so this is a plain counter plus an optional callback invoked
//! after every archive entry. The callback is throttled by the caller (see the CLI).

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot delivered to the progress callback.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    /// Entries handled so far (written, restored, or skipped).
    pub processed_entries: u64,
    /// Entries known up-front, 0 when unknown (unpacking a stream).
    pub total_entries: u64,
    pub processed_bytes: u64,
    pub skipped_entries: u64,
    pub current_path: String,
    pub elapsed_time: Duration,
}

impl ProgressState {
    pub fn progress_percent(&self) -> f32 {
        if self.total_entries == 0 {
            return 0.0;
        }
        (self.processed_entries as f32 / self.total_entries as f32 * 100.0).min(100.0)
    }

    pub fn speed_mbps(&self) -> f32 {
        let secs = self.elapsed_time.as_secs_f32();
        if secs <= 0.0 {
            return 0.0;
        }
        self.processed_bytes as f32 / (1024.0 * 1024.0) / secs
    }
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(&ProgressState) + Send + Sync;

/// Accumulates counters for one pass and forwards them to the callback.
pub struct ProgressTracker {
    state: ProgressState,
    start_time: Instant,
    callback: Option<Arc<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new(total_entries: u64, callback: Option<Arc<ProgressCallback>>) -> Self {
        Self {
            state: ProgressState { total_entries, ..Default::default() },
            start_time: Instant::now(),
            callback,
        }
    }

    pub fn record_entry(&mut self, path: &str, bytes: u64) {
        self.state.processed_entries += 1;
        self.state.processed_bytes += bytes;
        self.emit(path);
    }

    pub fn record_skipped(&mut self, path: &str) {
        self.state.processed_entries += 1;
        self.state.skipped_entries += 1;
        self.emit(path);
    }

    fn emit(&mut self, path: &str) {
        if let Some(cb) = &self.callback {
            self.state.current_path.clear();
            self.state.current_path.push_str(path);
            self.state.elapsed_time = self.start_time.elapsed();
            cb(&self.state);
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }
}
