//! Progress coalescing for running transfers.

use std::time::Duration;
use tokio::time::Instant;
use transfer_executor::ProgressEvent;

/// Latest progress of one transfer, flushed at most once per interval.
#[derive(Debug)]
pub struct ProgressTracker {
    size_hint: u64,
    interval: Duration,
    last_flush: Option<Instant>,
    latest: Option<ProgressEvent>,
    dirty: bool,
}

impl ProgressTracker {
    pub fn new(size_hint: u64, interval: Duration) -> Self {
        Self {
            size_hint,
            interval,
            last_flush: None,
            latest: None,
            dirty: false,
        }
    }

    /// Record an event. Returns `(bytes, percent)` when it is time to persist.
    pub fn record(&mut self, event: ProgressEvent) -> Option<(u64, f64)> {
        self.latest = Some(event);
        self.dirty = true;
        let due = self
            .last_flush
            .is_none_or(|at| at.elapsed() >= self.interval);
        if due { self.take() } else { None }
    }

    /// Unflushed progress, if any.
    pub fn take(&mut self) -> Option<(u64, f64)> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.last_flush = Some(Instant::now());
        self.latest.as_ref().map(|event| (event.bytes_transferred, self.percent(event)))
    }

    fn percent(&self, event: &ProgressEvent) -> f64 {
        if let Some(p) = event.percent {
            return f64::from(p).clamp(0.0, 100.0);
        }
        let total = event.total_bytes.unwrap_or(self.size_hint);
        if total == 0 {
            0.0
        } else {
            (event.bytes_transferred as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.latest
            .as_ref()
            .map(|event| event.bytes_transferred)
            .unwrap_or(0)
    }
}
