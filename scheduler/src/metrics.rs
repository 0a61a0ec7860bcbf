//! ABOUTME: Queue-health counters (§6.5, §7a) - atomic, read without touching the database
//! ABOUTME: Mirrors the source's JobMetrics shape: plain atomics, snapshot via Relaxed loads

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared across the dispatch loop, monitor, and retry engine. Each increments its own
/// counter on a successful tick outcome; nothing here ever touches the database.
#[derive(Debug, Default)]
pub struct QueueHealth {
    tasks_materialized: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_retried: AtomicU64,
}

impl QueueHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_materialized(&self) {
        self.tasks_materialized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueHealthSnapshot {
        QueueHealthSnapshot {
            tasks_materialized: self.tasks_materialized.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealthSnapshot {
    pub tasks_materialized: u64,
    pub tasks_timed_out: u64,
    pub tasks_retried: u64,
}
