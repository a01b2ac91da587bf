//! Relay counters and the periodic status snapshot
//!
//! Counters are plain shared atomics updated from the hot paths; the
//! status reporter samples them on its own schedule, so totals are
//! eventually consistent and informational only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    sent: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
}

impl RelayStats {
    pub fn incr_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_forwarded(&self, n: u64) {
        self.forwarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

/// One periodic status report, published on the bus by the reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Logical identity shared with siblings
    pub node: String,
    /// Resource id of this instance
    pub resource: String,
    pub sent: u64,
    pub received: u64,
    pub forwarded: u64,
    /// Depth of the live in-memory queue
    pub queue_depth: u64,
    /// Messages parked in the retry-store memory buffers
    pub backup_memory: u64,
    /// Messages parked on disk
    pub backup_disk: u64,
    pub timestamp: DateTime<Utc>,
}
