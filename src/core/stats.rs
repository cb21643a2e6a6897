use std::sync::atomic::{AtomicU64, Ordering};

/// Value copy of the request counters at one point in time.
///
/// Counters are monotonic and wrap at `u64::MAX` (documented, not expected
/// in practice). `total_requests` counts logical calls, not attempts;
/// `total_errors` counts attempts that failed or produced a >= 400 response;
/// `rate_limited` counts attempts observing HTTP 429.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    rate_limited: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}
