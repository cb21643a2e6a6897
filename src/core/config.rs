use std::time::Duration;

use crate::retry::RetryPolicy;

pub(crate) const DEFAULT_BURST: usize = 1;
pub(crate) const DEFAULT_ADAPTIVE_COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable configuration snapshot assembled by the builder. Pacing is
/// disabled when `rps <= 0`; the retry policy carries the budget, the
/// backoff seed, and the retryable status classification.
#[derive(Clone, Debug)]
pub(crate) struct ClientConfig {
    pub(crate) base_url: String,
    pub(crate) rps: f64,
    pub(crate) burst: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) adaptive_cooldown: Duration,
    /// Per-attempt transport timeout. `None` when a pre-built transport was
    /// injected; the injected transport owns its own deadline behavior.
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_response_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            rps: 0.0,
            burst: DEFAULT_BURST,
            retry: RetryPolicy::default(),
            adaptive_cooldown: DEFAULT_ADAPTIVE_COOLDOWN,
            timeout: Some(DEFAULT_TIMEOUT),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}
