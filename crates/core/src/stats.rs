//! Pipeline counters. Created once at startup and passed explicitly to the
//! repository and dispatch loop; every increment is mirrored to the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    admitted: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub admitted: u64,
    pub stale: u64,
    pub rejected: u64,
    pub published: u64,
    pub publish_failed: u64,
}

impl PipelineStats {
    pub fn new() -> Self { Self::default() }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_received_total", 1u64);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_admitted_total", 1u64);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_stale_total", 1u64);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_rejected_total", 1u64);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_published_total", 1u64);
    }

    pub fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
        counter!("vista_ops_publish_failed_total", 1u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
        }
    }
}
