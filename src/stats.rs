use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::UpsertOutcome;

/// Read-only summary of one run, handed to reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deprecated: u64,
    pub skipped: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunStats {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Counters shared by all workers of one run.
#[derive(Debug)]
pub struct StatsCollector {
    new: AtomicU64,
    updated: AtomicU64,
    unchanged: AtomicU64,
    deprecated: AtomicU64,
    skipped: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StatsCollector {
    pub fn start() -> Self {
        Self {
            new: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            deprecated: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn record_upsert(&self, outcome: UpsertOutcome) {
        self.new.fetch_add(outcome.new, Ordering::Relaxed);
        self.updated.fetch_add(outcome.updated, Ordering::Relaxed);
        self.unchanged.fetch_add(outcome.unchanged, Ordering::Relaxed);
    }

    pub fn record_deprecated(&self, count: u64) {
        self.deprecated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: u64) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn summary(&self) -> RunStats {
        RunStats {
            new: self.new.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            deprecated: self.deprecated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Decides when a processed-item count has crossed the next reporting
/// threshold, so that exactly one of many concurrent workers acts on it.
#[derive(Debug)]
pub struct ProgressGate {
    interval: u64,
    processed: AtomicU64,
    next_threshold: AtomicU64,
    persist_lock: Mutex<()>,
}

impl ProgressGate {
    pub fn new(interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            processed: AtomicU64::new(0),
            next_threshold: AtomicU64::new(interval),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Adds `count` processed items and, if a threshold was crossed, runs
    /// `persist` with the current total while holding the gate's lock.
    /// Returns whether `persist` ran.
    pub async fn advance<F, Fut>(&self, count: u64, persist: F) -> bool
    where
        F: FnOnce(u64) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let total = self.processed.fetch_add(count, Ordering::AcqRel) + count;
        if total < self.next_threshold.load(Ordering::Acquire) {
            return false;
        }

        let _guard = self.persist_lock.lock().await;
        let threshold = self.next_threshold.load(Ordering::Acquire);
        let current = self.processed();
        if current < threshold {
            return false;
        }
        let next = (current / self.interval + 1) * self.interval;
        self.next_threshold.store(next, Ordering::Release);
        persist(current).await;
        true
    }
}
