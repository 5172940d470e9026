use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hivewatch_core::Reading;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Pending count that triggers a flush.
    pub flush_size: usize,
    /// Hard upper bound on pending readings.
    pub capacity: usize,
    /// Age of the oldest pending reading that triggers a flush.
    pub flush_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_size: 100,
            capacity: 10_000,
            flush_timeout: Duration::from_secs(30),
        }
    }
}

/// Device-wide queue of readings waiting to be forwarded.
///
/// Once full, the oldest readings are dropped to make room for new ones.
pub struct LocalBuffer {
    config: BufferConfig,
    entries: Mutex<VecDeque<(Instant, Reading)>>,
    dropped: AtomicU64,
    flush_wanted: Notify,
}

impl LocalBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: BufferConfig {
                capacity,
                flush_size: config.flush_size.clamp(1, capacity),
                ..config
            },
            entries: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            flush_wanted: Notify::new(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub async fn append(&self, reading: Reading) {
        let len = {
            let mut entries = self.entries.lock().await;
            entries.push_back((Instant::now(), reading));
            self.evict_overflow(&mut entries);
            entries.len()
        };

        if len >= self.config.flush_size {
            self.flush_wanted.notify_one();
        }
    }

    /// Atomically drains every pending reading, oldest first.
    pub async fn flush(&self) -> Vec<Reading> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).map(|(_, r)| r).collect()
    }

    /// Puts readings that could not be delivered back at the front, in order.
    pub async fn requeue_front(&self, readings: Vec<Reading>) {
        if readings.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        for reading in readings.into_iter().rev() {
            entries.push_front((now, reading));
        }
        self.evict_overflow(&mut entries);
    }

    fn evict_overflow(&self, entries: &mut VecDeque<(Instant, Reading)>) {
        let excess = entries.len().saturating_sub(self.config.capacity);
        if excess == 0 {
            return;
        }
        entries.drain(..excess);
        let total = self.dropped.fetch_add(excess as u64, Ordering::Relaxed) + excess as u64;
        warn!(dropped = excess, total_dropped = total, "buffer full, dropped oldest readings");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Readings dropped on overflow since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether a flush is due right now.
    pub async fn flush_due(&self) -> bool {
        self.next_deadline().await.is_some_and(|d| d <= Instant::now())
    }

    /// `Some(now)` when at or above the flush size, otherwise the moment the
    /// oldest entry times out, or `None` when empty.
    async fn next_deadline(&self) -> Option<Instant> {
        let entries = self.entries.lock().await;
        if entries.len() >= self.config.flush_size {
            return Some(Instant::now());
        }
        entries
            .front()
            .map(|(queued_at, _)| *queued_at + self.config.flush_timeout)
    }

    /// Resolves once a flush is due.
    pub async fn wait_flush_due(&self) {
        loop {
            match self.next_deadline().await {
                Some(deadline) if deadline <= Instant::now() => return,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.flush_wanted.notified() => {}
                    }
                }
                None => self.flush_wanted.notified().await,
            }
        }
    }

    /// Wakes anyone blocked in [`wait_flush_due`](Self::wait_flush_due) to re-check.
    pub fn nudge(&self) {
        self.flush_wanted.notify_one();
    }
}
