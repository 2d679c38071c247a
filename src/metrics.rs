//! Process-global transfer performance counters.
//!
//! The retry loop records how long workers spend sleeping on
//! service-imposed throttling (`Retry-After` / 429) and on timeout-induced
//! backoffs.  The counters are plain atomics updated with relaxed adds;
//! [`get_perf_counters`] snapshots them and [`reset_perf_counters`] zeroes
//! them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

static MS_WAIT_THROTTLED: AtomicU64 = AtomicU64::new(0);
static MS_WAIT_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static COUNT_THROTTLED: AtomicU64 = AtomicU64::new(0);
static COUNT_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerfCounters {
    /// Milliseconds spent sleeping on throttle-induced backoffs.
    pub ms_wait_throttled: u64,
    /// Milliseconds spent sleeping on timeout-induced backoffs.
    pub ms_wait_timeouts: u64,
    /// Number of throttle-induced backoffs.
    pub count_throttled: u64,
    /// Number of timeout-induced backoffs.
    pub count_timeouts: u64,
}

/// Snapshot the counters.
pub fn get_perf_counters() -> PerfCounters {
    PerfCounters {
        ms_wait_throttled: MS_WAIT_THROTTLED.load(Ordering::Relaxed),
        ms_wait_timeouts: MS_WAIT_TIMEOUTS.load(Ordering::Relaxed),
        count_throttled: COUNT_THROTTLED.load(Ordering::Relaxed),
        count_timeouts: COUNT_TIMEOUTS.load(Ordering::Relaxed),
    }
}

/// Zero all counters.
pub fn reset_perf_counters() {
    MS_WAIT_THROTTLED.store(0, Ordering::Relaxed);
    MS_WAIT_TIMEOUTS.store(0, Ordering::Relaxed);
    COUNT_THROTTLED.store(0, Ordering::Relaxed);
    COUNT_TIMEOUTS.store(0, Ordering::Relaxed);
}

pub(crate) fn record_throttle_wait(waited: Duration) {
    MS_WAIT_THROTTLED.fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    COUNT_THROTTLED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_timeout_wait(waited: Duration) {
    MS_WAIT_TIMEOUTS.fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    COUNT_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

// -- Tests --------------------------------------------------------------------
