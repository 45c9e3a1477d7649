//! Run progress: monotonic counters with throttled publication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pravah_core::Progress;
use tokio::sync::watch;

/// Counters for one run. Increment-only, so snapshots are monotonic
/// non-decreasing; publication through the watch channel is rate-limited
/// to one update per interval, with a forced publication at the end.
pub struct ProgressCounters {
    bytes_in: Arc<AtomicU64>,
    rows_in: AtomicU64,
    rows_out: AtomicU64,
    bytes_out: AtomicU64,
    publisher: watch::Sender<Progress>,
    last_publish: Mutex<Instant>,
    interval: Duration,
}

impl ProgressCounters {
    pub fn new(interval: Duration) -> (Arc<Self>, watch::Receiver<Progress>) {
        let (publisher, subscriber) = watch::channel(Progress::default());
        (
            Arc::new(Self {
                bytes_in: Arc::new(AtomicU64::new(0)),
                rows_in: AtomicU64::new(0),
                rows_out: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                publisher,
                last_publish: Mutex::new(Instant::now()),
                interval,
            }),
            subscriber,
        )
    }

    /// Shared input-byte counter, handed to the codec reader.
    pub fn bytes_in_counter(&self) -> Arc<AtomicU64> {
        self.bytes_in.clone()
    }

    pub fn add_rows_in(&self, rows: u64) {
        self.rows_in.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_rows_out(&self, rows: u64) {
        self.rows_out.fetch_add(rows, Ordering::Relaxed);
    }

    /// Output bytes only grow; stale writers cannot move the counter back.
    pub fn record_bytes_out(&self, bytes: u64) {
        self.bytes_out.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Non-blocking snapshot of the current counters.
    pub fn snapshot(&self) -> Progress {
        Progress {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            rows_in: self.rows_in.load(Ordering::Relaxed),
            rows_out: self.rows_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Publish at most once per interval.
    pub fn maybe_publish(&self) {
        let mut last = self.last_publish.lock().expect("progress clock poisoned");
        if last.elapsed() < self.interval {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.publisher.send_replace(self.snapshot());
    }

    /// Unconditional publication, used at terminal transitions.
    pub fn force_publish(&self) {
        self.publisher.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_monotonic() {
        let (p, _rx) = ProgressCounters::new(Duration::from_millis(500));
        p.add_rows_in(10);
        p.record_bytes_out(100);
        p.record_bytes_out(40);
        let s = p.snapshot();
        assert_eq!(s.rows_in, 10);
        assert_eq!(s.bytes_out, 100);
    }

    #[test]
    fn publication_is_throttled_but_forceable() {
        let (p, rx) = ProgressCounters::new(Duration::from_secs(3600));
        p.add_rows_in(1);
        p.maybe_publish();
        assert_eq!(rx.borrow().rows_in, 0);
        p.force_publish();
        assert_eq!(rx.borrow().rows_in, 1);
    }
}
