//! Per-source transfer counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters shared between the producer task, readers, and the
/// stat-log/stall tasks. All relaxed: the counters order nothing.
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Bytes read from the input, including headers
    pub bytes_in: AtomicU64,
    /// Bytes copied out to readers, including headers
    pub bytes_out: AtomicU64,
    /// Bytes discarded by the frame filter while hunting for a boundary
    pub bytes_invalid: AtomicU64,
}

impl SourceStats {
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_invalid(&self, n: u64) {
        self.bytes_invalid.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_invalid: self.bytes_invalid.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a source's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_invalid: u64,
}
