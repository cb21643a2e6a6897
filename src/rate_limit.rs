use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::util::lock_unpoisoned;

/// Why a limiter wait ended without handing out a token.
#[derive(Debug)]
pub(crate) enum WaitError {
    Cancelled,
    /// The bucket can never produce a token (burst forced to zero while the
    /// rate stays positive).
    Starved,
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: usize, now: Instant) -> Self {
        let rate = normalize_rate(rate);
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        if self.rate <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed_secs * self.rate).min(self.burst);
    }

    fn set_limit(&mut self, rate: f64, burst: usize, now: Instant) {
        // Credit time elapsed at the old rate before switching.
        self.refill(now);
        self.rate = normalize_rate(rate);
        self.burst = burst as f64;
        self.tokens = self.tokens.min(self.burst);
    }

    fn set_rate(&mut self, rate: f64, now: Instant) {
        self.refill(now);
        self.rate = normalize_rate(rate);
    }
}

fn normalize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        0.0
    }
}

/// Token-bucket pacer shared by all logical requests of one client.
///
/// A zero rate means pacing is disabled and `wait` returns immediately.
/// `set_limit` hot-swaps rate and burst; waiters suspended in `wait` observe
/// the new parameters on their next token check. The bucket mutex is held
/// only for the token arithmetic, never across an await.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub(crate) fn new(rate: f64, burst: usize) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate, burst, Instant::now())),
        }
    }

    /// Consumes one token, suspending until one is available or the token
    /// fires, whichever comes first.
    pub(crate) async fn wait(&self, token: &CancellationToken) -> Result<(), WaitError> {
        loop {
            let delay = {
                let mut bucket = lock_unpoisoned(&self.bucket);
                let now = Instant::now();
                bucket.refill(now);
                if bucket.rate <= 0.0 {
                    return Ok(());
                }
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                if bucket.burst < 1.0 {
                    return Err(WaitError::Starved);
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };

            tokio::select! {
                _ = token.cancelled() => return Err(WaitError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    pub(crate) fn set_limit(&self, rate: f64, burst: usize) {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.set_limit(rate, burst, Instant::now());
    }

    /// Adjusts the refill rate only, preserving the burst capacity. Used by
    /// the adaptive throttle.
    pub(crate) fn set_rate(&self, rate: f64) {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.set_rate(rate, Instant::now());
    }

    /// Current (rate, burst). A zero rate means pacing is disabled.
    pub(crate) fn limit(&self) -> (f64, usize) {
        let bucket = lock_unpoisoned(&self.bucket);
        (bucket.rate, bucket.burst as usize)
    }
}
