use crate::reading::EnrichedReading;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Buffer configuration
#[derive(Clone, Debug, Deserialize)]
pub struct BufferConfig {
    /// Main buffer capacity; adds beyond it shed the newest load
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Retry buffer capacity
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
    /// Seconds a failed write stays retryable
    #[serde(default = "default_retry_ttl")]
    pub retry_ttl_secs: i64,
    /// Periodic flush cadence, bounding staleness regardless of occupancy
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Retry-drain cadence
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_capacity() -> usize {
    10_000
}

fn default_retry_capacity() -> usize {
    1_000
}

fn default_retry_ttl() -> i64 {
    300
}

fn default_flush_interval() -> u64 {
    1
}

fn default_retry_interval() -> u64 {
    5
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            retry_capacity: default_retry_capacity(),
            retry_ttl_secs: default_retry_ttl(),
            flush_interval_secs: default_flush_interval(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

/// A reading whose batch failed persistence, awaiting another attempt.
#[derive(Clone, Debug)]
pub struct RetryItem {
    pub reading: EnrichedReading,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Buffer statistics, shared across execution contexts.
#[derive(Debug, Default)]
pub struct BufferStats {
    added: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

impl BufferStats {
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }
}

struct BufferInner {
    queue: VecDeque<EnrichedReading>,
    retry: VecDeque<RetryItem>,
}

/// Bounded FIFO staging area for enriched readings awaiting a batched write.
///
/// `add` and `flush` share one critical section, so no reading can be both
/// drained and re-added within the same flush. A full buffer sheds the
/// incoming item rather than blocking the delivery callback.
pub struct IngestBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
    retry_capacity: usize,
    retry_ttl: Duration,
    pub stats: BufferStats,
}

impl IngestBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                queue: VecDeque::with_capacity(config.capacity.min(1024)),
                retry: VecDeque::new(),
            }),
            capacity: config.capacity,
            retry_capacity: config.retry_capacity,
            retry_ttl: Duration::seconds(config.retry_ttl_secs),
            stats: BufferStats::default(),
        }
    }

    /// Append a reading. Returns false (and counts a drop) when full.
    pub fn add(&self, reading: EnrichedReading) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= self.capacity {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.queue.push_back(reading);
        self.stats.added.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Whether occupancy crossed the flush threshold (80% of capacity).
    pub fn should_flush(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() >= self.capacity * 4 / 5
    }

    /// Drain up to `max` readings (the whole buffer when None) in one
    /// lock acquisition, preserving arrival order.
    pub fn flush(&self, max: Option<usize>) -> Vec<EnrichedReading> {
        let mut inner = self.inner.lock().unwrap();
        let n = max.unwrap_or(inner.queue.len()).min(inner.queue.len());
        let batch: Vec<EnrichedReading> = inner.queue.drain(..n).collect();
        self.stats.flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Enqueue a failed write for retry, respecting the retry bound.
    pub fn add_retry(&self, item: RetryItem) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.retry.len() >= self.retry_capacity {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.retry.push_back(item);
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drain retryable items: everything younger than the TTL comes back
    /// with its attempt count incremented; expired items are dropped and
    /// counted.
    pub fn drain_retries(&self, now: DateTime<Utc>) -> Vec<RetryItem> {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<RetryItem> = inner.retry.drain(..).collect();
        drop(inner);

        let mut retryable = Vec::new();
        for mut item in drained {
            if now - item.enqueued_at > self.retry_ttl {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                item.attempts += 1;
                retryable.push(item);
            }
        }
        retryable
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn retry_len(&self) -> usize {
        self.inner.lock().unwrap().retry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
