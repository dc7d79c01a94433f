//! Counters shared by the live-sync components

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Running counters for one live-sync instance
#[derive(Debug, Default)]
pub struct SyncStats {
    samples_applied: AtomicU64,
    samples_rejected: AtomicU64,
    samples_discarded: AtomicU64,
    pulls_succeeded: AtomicU64,
    pulls_failed: AtomicU64,
    frames_malformed: AtomicU64,
    reconnects: AtomicU64,
    stale_transitions: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Samples written to the store
    pub samples_applied: u64,
    /// Samples dropped for being older than the stored one
    pub samples_rejected: u64,
    /// Samples dropped because their topic is not attached
    pub samples_discarded: u64,
    /// Poll requests that produced a sample
    pub pulls_succeeded: u64,
    /// Poll requests that failed
    pub pulls_failed: u64,
    /// Push frames that could not be parsed
    pub frames_malformed: u64,
    /// Push channel reconnect attempts
    pub reconnects: u64,
    /// Topics that went stale
    pub stale_transitions: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl SyncStats {
    counter!(record_applied, samples_applied);
    counter!(record_rejected, samples_rejected);
    counter!(record_discarded, samples_discarded);
    counter!(record_pull_ok, pulls_succeeded);
    counter!(record_pull_failed, pulls_failed);
    counter!(record_malformed, frames_malformed);
    counter!(record_reconnect, reconnects);
    counter!(record_stale, stale_transitions);

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_applied: self.samples_applied.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            pulls_succeeded: self.pulls_succeeded.load(Ordering::Relaxed),
            pulls_failed: self.pulls_failed.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            stale_transitions: self.stale_transitions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SyncStats::default();
        stats.record_applied();
        stats.record_applied();
        stats.record_pull_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.samples_applied, 2);
        assert_eq!(snap.pulls_failed, 1);
        assert_eq!(snap.reconnects, 0);
    }
}
