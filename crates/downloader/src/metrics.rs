use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Delivery and scheduling counters, sampled by the progress surface.
#[derive(Default)]
pub struct SyncMetrics {
    pub header_in: AtomicU64,
    pub header_drop: AtomicU64,
    pub header_timeout: AtomicU64,
    pub body_in: AtomicU64,
    pub body_drop: AtomicU64,
    pub body_timeout: AtomicU64,
    pub receipt_in: AtomicU64,
    pub receipt_drop: AtomicU64,
    pub receipt_timeout: AtomicU64,
    pub state_in: AtomicU64,
    pub state_drop: AtomicU64,
    pub throttles: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub header_in: u64,
    pub header_drop: u64,
    pub header_timeout: u64,
    pub body_in: u64,
    pub body_drop: u64,
    pub body_timeout: u64,
    pub receipt_in: u64,
    pub receipt_drop: u64,
    pub receipt_timeout: u64,
    pub state_in: u64,
    pub state_drop: u64,
    pub throttles: u64,
}

impl SyncMetrics {
    pub fn record_in(counter: &AtomicU64, items: usize) {
        counter.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            header_in: self.header_in.load(Ordering::Relaxed),
            header_drop: self.header_drop.load(Ordering::Relaxed),
            header_timeout: self.header_timeout.load(Ordering::Relaxed),
            body_in: self.body_in.load(Ordering::Relaxed),
            body_drop: self.body_drop.load(Ordering::Relaxed),
            body_timeout: self.body_timeout.load(Ordering::Relaxed),
            receipt_in: self.receipt_in.load(Ordering::Relaxed),
            receipt_drop: self.receipt_drop.load(Ordering::Relaxed),
            receipt_timeout: self.receipt_timeout.load(Ordering::Relaxed),
            state_in: self.state_in.load(Ordering::Relaxed),
            state_drop: self.state_drop.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
        }
    }
}
