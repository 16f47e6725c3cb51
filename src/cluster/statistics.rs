//! Process-wide client counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by event taps across the client.
///
/// Owned by the [`Cluster`](super::Cluster) instance and shared with the
/// routers; all updates are atomic adds, reads are a lock-free value copy via
/// [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct Statistics {
    successful_sent: AtomicU64,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    node_dead: AtomicU64,
    expired: AtomicU64,
    discarded: AtomicU64,
    exited: AtomicU64,
    received: AtomicU64,
}

impl Statistics {
    /// Messages acknowledged by a broker, reported by the produce router.
    pub fn record_successful_sent(&self, count: u64) {
        self.successful_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_dead(&self) {
        self.node_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages that expired before a broker acknowledged them.
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages dropped by the produce router.
    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// A long-lived worker exited.
    pub fn record_exited(&self) {
        self.exited.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages delivered by the consume router.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            successful_sent: self.successful_sent.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            node_dead: self.node_dead.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exited: self.exited.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Value copy of [`Statistics`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    pub successful_sent: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub node_dead: u64,
    pub expired: u64,
    pub discarded: u64,
    pub exited: u64,
    pub received: u64,
}
