//! Per-handle operation counters.

use serde::{Deserialize, Serialize};

/// Counters for one [`crate::FileHandle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleStats {
    /// Successful opens, including reopens.
    pub opens: u64,
    /// Reopens forced by a failed integrity check.
    pub reopens: u64,
    /// Integrity checks that found a replaced or missing file.
    pub integrity_failures: u64,
    /// OS-level lock attempts.
    pub lock_attempts: u64,
    /// Sleeps taken between nonblocking attempts.
    pub lock_retries: u64,
    /// Locks granted.
    pub locks_acquired: u64,
    /// Acquisitions abandoned after the retry budget ran out.
    pub lock_contentions: u64,
    /// Locks released.
    pub unlocks: u64,
    /// Mapped views handed out.
    pub maps_created: u64,
    /// Mapping requests that failed.
    pub map_failures: u64,
}

impl HandleStats {
    /// Fraction of lock attempts that did not immediately succeed.
    pub fn contention_ratio(&self) -> f64 {
        if self.lock_attempts == 0 {
            return 0.0;
        }
        self.lock_retries as f64 / self.lock_attempts as f64
    }
}
