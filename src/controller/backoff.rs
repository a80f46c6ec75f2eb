//! Per-cluster requeue schedule.
//!
//! Failed reconciliations are retried on a stepped schedule:
//!
//! | Consecutive failures | Delay |
//! |----------------------|-------|
//! | 1                    | 200ms |
//! | 2 - 60               | 1s    |
//! | 61 - 120             | 10s   |
//! | more                 | 60s   |
//!
//! A successful reconciliation forgets the key and resets the schedule.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Delay before the `failures`-th retry (1-based).
pub fn delay_for(failures: u32) -> Duration {
    match failures {
        0 | 1 => Duration::from_millis(200),
        2..=60 => Duration::from_secs(1),
        61..=120 => Duration::from_secs(10),
        _ => Duration::from_secs(60),
    }
}

/// Failure counters keyed by `namespace/name`.
#[derive(Debug, Default)]
pub struct RequeueSchedule {
    failures: Mutex<HashMap<String, u32>>,
}

impl RequeueSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        delay_for(*count)
    }

    /// Reset the schedule of `key` after a successful reconciliation.
    pub fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(key).copied().unwrap_or(0)
    }
}
