//! Daemon counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live daemon counters (lock-free)
#[derive(Debug, Default)]
pub struct DaemonStats {
    /// Bundles accepted by the input processor
    pub received: AtomicU64,
    /// Bundles delivered to local registrations
    pub delivered: AtomicU64,
    /// Bundles fully transmitted on links
    pub transmitted: AtomicU64,
    /// Bundles expired before delivery
    pub expired: AtomicU64,
    /// Duplicate arrivals suppressed
    pub duplicates: AtomicU64,
    /// Bundles rejected at input
    pub rejected: AtomicU64,
    /// Administrative bundles generated locally
    pub generated: AtomicU64,
    /// Bundles deleted
    pub deleted: AtomicU64,
    /// Events processed across all processors
    pub events_processed: AtomicU64,
}

impl DaemonStats {
    /// Point-in-time copy for status replies
    pub fn snapshot(&self) -> DaemonStatsSnapshot {
        DaemonStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
        }
    }

    /// Bump a counter by one
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable stats snapshot answered to status queries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatsSnapshot {
    /// Bundles accepted by the input processor
    pub received: u64,
    /// Bundles delivered to local registrations
    pub delivered: u64,
    /// Bundles fully transmitted on links
    pub transmitted: u64,
    /// Bundles expired before delivery
    pub expired: u64,
    /// Duplicate arrivals suppressed
    pub duplicates: u64,
    /// Bundles rejected at input
    pub rejected: u64,
    /// Administrative bundles generated locally
    pub generated: u64,
    /// Bundles deleted
    pub deleted: u64,
    /// Events processed across all processors
    pub events_processed: u64,
}
