use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::rate_limit::RateLimiter;
use crate::util::lock_unpoisoned;

/// Floor for the reduced rate, preventing a pathological zero rate.
const MIN_REDUCED_RATE: f64 = 0.01;

#[derive(Debug)]
struct AdaptiveState {
    original_rate: f64,
    restore: Option<JoinHandle<()>>,
    /// Bumped on every re-arm; a restore task only fires if its epoch is
    /// still current. Abort alone is not enough: a task already past its
    /// sleep could otherwise undo a newer re-arm.
    epoch: u64,
    closed: bool,
}

/// Temporarily halves the pacing rate after a rate-limit observation and
/// restores it once the cooldown elapses without another one.
///
/// A repeated observation while already reduced does not halve again; it
/// cancels the pending restore and re-arms it at the full cooldown (sliding
/// restore). The reduced rate stays at half the original, never a quarter.
/// Close is terminal: the pending restore is aborted and further reductions
/// become no-ops. All transitions are serialized on one mutex, held only
/// for the update itself.
#[derive(Debug)]
pub(crate) struct AdaptiveThrottle {
    limiter: Arc<RateLimiter>,
    cooldown: Duration,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveThrottle {
    pub(crate) fn new(limiter: Arc<RateLimiter>, cooldown: Duration, original_rate: f64) -> Self {
        Self {
            limiter,
            cooldown,
            state: Mutex::new(AdaptiveState {
                original_rate,
                restore: None,
                epoch: 0,
                closed: false,
            }),
        }
    }

    /// Halves the effective rate and (re-)arms the restore task. No-op when
    /// closed or when pacing is disabled.
    pub(crate) fn reduce(self: &Arc<Self>) {
        let mut state = lock_unpoisoned(&self.state);
        if state.closed || state.original_rate <= 0.0 {
            return;
        }

        let reduced = (state.original_rate / 2.0).max(MIN_REDUCED_RATE);
        self.limiter.set_rate(reduced);
        debug!(reduced, cooldown_ms = self.cooldown.as_millis() as u64, "rate limit reduced");

        if let Some(restore) = state.restore.take() {
            restore.abort();
        }
        state.epoch = state.epoch.wrapping_add(1);
        let epoch = state.epoch;
        let throttle = Arc::clone(self);
        state.restore = Some(tokio::spawn(async move {
            tokio::time::sleep(throttle.cooldown).await;
            let mut state = lock_unpoisoned(&throttle.state);
            if state.epoch != epoch {
                return;
            }
            state.restore = None;
            if !state.closed {
                throttle.limiter.set_rate(state.original_rate);
                debug!(rate = state.original_rate, "rate limit restored");
            }
        }));
    }

    /// Rebases the original rate and applies it to the limiter, e.g. after
    /// `set_rate_limit`. A pending restore keeps running and will restore to
    /// the new original.
    pub(crate) fn set_original(&self, rate: f64, burst: usize) {
        let mut state = lock_unpoisoned(&self.state);
        state.original_rate = rate;
        self.limiter.set_limit(rate, burst);
    }

    /// Idempotent. Stops the pending restore within one scheduler tick;
    /// in-flight requests are unaffected.
    pub(crate) fn close(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.closed = true;
        if let Some(restore) = state.restore.take() {
            restore.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }
}
