use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode, header::RETRY_AFTER};
use rand::Rng;

use crate::error::TransportErrorKind;

const JITTER_RATIO: f64 = 0.25;

/// What the executor knows about a finished attempt when deciding whether to
/// try again. Exactly one of `status` and `transport_error_kind` is set.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_retries: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
}

/// Custom retry decision. When configured it supersedes the default
/// classification (transport errors retryable, statuses checked against the
/// retryable set); the retry budget check still runs first.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        self(decision)
    }
}

#[derive(Clone)]
pub(crate) struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    retryable_status_codes: BTreeSet<u16>,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_backoff", &self.initial_backoff)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub(crate) fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub(crate) fn set_retry(&mut self, max_retries: usize, initial_backoff: Duration) {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff.max(Duration::from_millis(1));
    }

    /// Replaces the retryable status set wholesale.
    pub(crate) fn set_retryable_status_codes(&mut self, codes: impl IntoIterator<Item = u16>) {
        self.retryable_status_codes = codes.into_iter().collect();
    }

    pub(crate) fn set_classifier(&mut self, classifier: Arc<dyn RetryClassifier>) {
        self.classifier = Some(classifier);
    }

    /// The full decision function: budget first, then the custom classifier
    /// if any, then the defaults (transport errors retryable, statuses
    /// checked against the retryable set).
    pub(crate) fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if decision.attempt >= self.max_retries {
            return false;
        }
        self.is_retryable_observation(decision)
    }

    /// The classification alone, ignoring the budget. Used to tell an
    /// exhausted retryable status apart from a plainly terminal one.
    pub(crate) fn is_retryable_observation(&self, decision: &RetryDecision) -> bool {
        if let Some(classifier) = &self.classifier {
            return classifier.should_retry(decision);
        }
        if decision.transport_error_kind.is_some() {
            return true;
        }
        match decision.status {
            Some(status) => self.retryable_status_codes.contains(&status.as_u16()),
            None => false,
        }
    }

    /// Backoff before attempt `attempt` (1-based): `initial * 2^(attempt-1)`
    /// with symmetric +/-25% jitter. The exponent is capped so the doubling
    /// never overflows; a negative product clamps back to the initial value.
    pub(crate) fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let base = self.initial_backoff.saturating_mul(1_u32 << exponent);

        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-JITTER_RATIO..=JITTER_RATIO);
        let delay_secs = base.as_secs_f64() * (1.0 + jitter);
        if delay_secs <= 0.0 {
            return self.initial_backoff;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            retryable_status_codes: default_retryable_status_codes(),
            classifier: None,
        }
    }
}

pub(crate) fn default_retryable_status_codes() -> BTreeSet<u16> {
    [
        StatusCode::TOO_MANY_REQUESTS.as_u16(),
        StatusCode::SERVICE_UNAVAILABLE.as_u16(),
    ]
    .into_iter()
    .collect()
}

/// Parses a `Retry-After` value: non-negative decimal seconds (fractions
/// ceilinged to the next whole second) or an HTTP-date (RFC 1123, RFC 850,
/// asctime). Empty, unparseable, and past values yield zero.
pub(crate) fn parse_retry_after(value: &str, now: SystemTime) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Duration::from_secs(seconds.ceil() as u64);
        }
        return Duration::ZERO;
    }

    match httpdate::parse_http_date(value) {
        Ok(date) => date.duration_since(now).unwrap_or(Duration::ZERO),
        Err(_) => Duration::ZERO,
    }
}

pub(crate) fn retry_after_from_headers(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    Some(parse_retry_after(value, now))
}
