use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::Full;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};

use crate::adaptive::AdaptiveThrottle;
use crate::body::{Body, ReadBodyError, TransportBody, attempt_request, capture, read_body_limited};
use crate::config::ClientConfig;
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::hooks::{Hooks, RequestContext};
use crate::rate_limit::{RateLimiter, WaitError};
use crate::response::Response;
use crate::retry::{RetryClassifier, RetryDecision, retry_after_from_headers};
use crate::stats::{StatsRecorder, StatsSnapshot};
use crate::transport::{HttpTransport, HyperTransport, classify_transport_error};
use crate::util::join_base_path;

/// A resilient HTTP client: token-bucket pacing, bounded retry with jittered
/// exponential backoff, adaptive rate reduction after rate-limit responses,
/// and atomic request statistics around a single injectable transport.
///
/// Cloning is cheap and all clones share the same limiter, adaptive state,
/// and counters. The client is safe for concurrent use; each logical request
/// runs independently and serializes only on the shared pacer.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    adaptive: Arc<AdaptiveThrottle>,
    stats: StatsRecorder,
    hooks: Hooks,
}

/// Configures and builds a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    hooks: Hooks,
}

impl ClientBuilder {
    /// Prefix prepended to paths in the convenience calls (`get`, `post`,
    /// `send_json`). Requests passed to `execute` use their own URI as-is.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Token-bucket pacing in requests per second. A non-positive rate
    /// disables pacing; a non-positive burst keeps the default of 1.
    pub fn rate_limit(mut self, rps: f64, burst: usize) -> Self {
        self.config.rps = rps;
        if burst > 0 {
            self.config.burst = burst;
        }
        self
    }

    /// Retry budget and backoff seed. The backoff doubles on each attempt
    /// with symmetric +/-25% jitter applied.
    pub fn retry(mut self, max_retries: usize, initial_backoff: Duration) -> Self {
        self.config.retry.set_retry(max_retries, initial_backoff);
        self
    }

    /// Replaces the default retryable status set ({429, 503}) wholesale.
    pub fn retryable_status(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.retry.set_retryable_status_codes(codes);
        self
    }

    /// Custom retry decision, superseding the default classification. The
    /// retry budget check still applies first.
    pub fn retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.config.retry.set_classifier(classifier);
        self
    }

    /// How long a halved rate stays in effect after the last rate-limit
    /// observation before it is restored.
    pub fn adaptive_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.adaptive_cooldown = cooldown;
        self
    }

    /// Per-attempt transport timeout. Ignored when a transport is injected.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Hard cap on the response body read, in bytes.
    pub fn max_response_size(mut self, max_response_size: usize) -> Self {
        self.config.max_response_size = max_response_size.max(1);
        self
    }

    /// Injects a pre-built transport. Disables the `timeout` option; the
    /// injected transport owns its own deadline behavior.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Invoked per attempt that returned a >= 400 response, retryable or
    /// terminal.
    pub fn on_error(
        mut self,
        on_error: impl Fn(StatusCode, &RequestContext) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error = Some(Arc::new(on_error));
        self
    }

    /// Invoked per successful (2xx/3xx, non-retried) attempt.
    pub fn on_success(
        mut self,
        on_success: impl Fn(&RequestContext, StatusCode) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_success = Some(Arc::new(on_success));
        self
    }

    /// Invoked per retryable attempt observing HTTP 429.
    pub fn on_rate_limited(
        mut self,
        on_rate_limited: impl Fn(&RequestContext) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_rate_limited = Some(Arc::new(on_rate_limited));
        self
    }

    /// Pre-dispatch mutation of each attempt's headers.
    pub fn request_hook(
        mut self,
        request_hook: impl Fn(&RequestContext, &mut HeaderMap) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.request_hook = Some(Arc::new(request_hook));
        self
    }

    /// Post-dispatch observation of each attempt's response head, before the
    /// body is read.
    pub fn response_hook(
        mut self,
        response_hook: impl Fn(&RequestContext, StatusCode, &HeaderMap) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.response_hook = Some(Arc::new(response_hook));
        self
    }

    pub fn build(self) -> Client {
        let ClientBuilder {
            mut config,
            transport,
            hooks,
        } = self;
        if transport.is_some() {
            config.timeout = None;
        }
        let transport = transport.unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let limiter = Arc::new(RateLimiter::new(config.rps, config.burst));
        let adaptive = Arc::new(AdaptiveThrottle::new(
            Arc::clone(&limiter),
            config.adaptive_cooldown,
            config.rps,
        ));

        Client {
            inner: Arc::new(ClientInner {
                config,
                transport,
                limiter,
                adaptive,
                stats: StatsRecorder::default(),
                hooks,
            }),
        }
    }
}

enum RoundTripFailure {
    Cancelled,
    Transport {
        kind: TransportErrorKind,
        source: BoxError,
    },
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Runs one logical request through the resilience pipeline: pace,
    /// attempt, classify, adapt, back off, repeat until terminal.
    ///
    /// The caller owns the cancellation token; it interrupts the limiter
    /// wait, the backoff sleep, the round trip, and the body read. A
    /// terminal >= 400 response is surfaced as [`Error::HttpStatus`] with
    /// the body attached so API error payloads stay inspectable.
    pub async fn execute(
        &self,
        request: Request<Body>,
        token: &CancellationToken,
    ) -> crate::Result<Response> {
        let (parts, body) = request.into_parts();
        let method = parts.method;
        let uri = parts.uri;
        let headers = parts.headers;
        let uri_text = uri.to_string();

        // Initial pacing happens before the request is counted: a caller
        // cancelled while queued never made a request.
        self.pace(token, &method, &uri_text).await?;
        self.inner.stats.record_request();

        let body_bytes = capture(body)
            .await
            .map_err(|source| Error::ReadRequestBody {
                method: method.clone(),
                uri: uri_text.clone(),
                source,
            })?;

        let max_retries = self.inner.config.retry.max_retries();
        let mut last_status: Option<StatusCode> = None;
        let mut last_error: Option<Error> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = self.inner.config.retry.backoff_for_attempt(attempt);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "backing off");
                self.sleep_cancellable(backoff, token, &method, &uri_text)
                    .await?;
                self.pace(token, &method, &uri_text).await?;
            }

            // The span is entered only around the synchronous sections; the
            // request future must stay Send for spawned callers.
            let span = info_span!(
                "tenax.request",
                method = %method,
                uri = %uri_text,
                attempt,
                max_retries
            );
            let context =
                RequestContext::new(method.clone(), uri_text.clone(), attempt, max_retries);

            let outbound = span.in_scope(|| {
                let mut attempt_headers = headers.clone();
                self.inner
                    .hooks
                    .run_request_hook(&context, &mut attempt_headers);
                debug!("dispatching attempt");
                attempt_request(
                    method.clone(),
                    uri.clone(),
                    attempt_headers,
                    body_bytes.clone(),
                )
            });

            let response = match self.round_trip(outbound, token).await {
                Ok(response) => response,
                Err(RoundTripFailure::Cancelled) => {
                    self.inner.stats.record_error();
                    return Err(Error::Cancelled {
                        method,
                        uri: uri_text,
                    });
                }
                Err(RoundTripFailure::Transport { kind, source }) => {
                    self.inner.stats.record_error();
                    let transport_error = Error::Transport {
                        kind,
                        method: method.clone(),
                        uri: uri_text.clone(),
                        source,
                    };
                    let decision = RetryDecision {
                        attempt,
                        max_retries,
                        method: method.clone(),
                        uri: uri_text.clone(),
                        status: None,
                        transport_error_kind: Some(kind),
                    };
                    if self.inner.config.retry.should_retry_decision(&decision) {
                        warn!(error = %transport_error, "retrying after transport error");
                        last_status = None;
                        last_error = Some(transport_error);
                        continue;
                    }
                    return Err(transport_error);
                }
            };

            let status = response.status();
            let response_headers = response.headers().clone();
            self.inner
                .hooks
                .run_response_hook(&context, status, &response_headers);

            let response_body = match read_body_limited(
                response.into_body(),
                self.inner.config.max_response_size,
                token,
            )
            .await
            {
                Ok(body) => body,
                Err(ReadBodyError::Read(source)) => {
                    self.inner.stats.record_error();
                    return Err(Error::ReadBody {
                        status: status.as_u16(),
                        method,
                        uri: uri_text,
                        source,
                    });
                }
                Err(ReadBodyError::Cancelled) => {
                    self.inner.stats.record_error();
                    return Err(Error::ReadBody {
                        status: status.as_u16(),
                        method,
                        uri: uri_text,
                        source: "request cancelled during body read".into(),
                    });
                }
                Err(ReadBodyError::TooLarge { actual_bytes }) => {
                    self.inner.stats.record_error();
                    return Err(Error::BodyTooLarge {
                        status: status.as_u16(),
                        limit_bytes: self.inner.config.max_response_size,
                        actual_bytes,
                        method,
                        uri: uri_text,
                    });
                }
            };

            last_status = Some(status);
            let decision = RetryDecision {
                attempt,
                max_retries,
                method: method.clone(),
                uri: uri_text.clone(),
                status: Some(status),
                transport_error_kind: None,
            };
            let retryable_class = self.inner.config.retry.is_retryable_observation(&decision);

            if retryable_class && attempt < max_retries {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    self.inner.stats.record_rate_limited();
                    self.inner.hooks.run_on_rate_limited(&context);
                }
                self.inner.stats.record_error();
                self.inner.hooks.run_on_error(status, &context);
                self.inner.adaptive.reduce();

                let retry_after = retry_after_from_headers(&response_headers, SystemTime::now());
                warn!(
                    status = status.as_u16(),
                    retry_after_ms = retry_after.map(|delay| delay.as_millis() as u64),
                    "retrying after retryable status"
                );
                last_error = Some(Error::HttpStatus {
                    status: status.as_u16(),
                    method: method.clone(),
                    uri: uri_text.clone(),
                    body: response_body,
                });
                continue;
            }

            if status.as_u16() >= 400 {
                self.inner.stats.record_error();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    self.inner.stats.record_rate_limited();
                }
                self.inner.hooks.run_on_error(status, &context);
                let status_error = Error::HttpStatus {
                    status: status.as_u16(),
                    method,
                    uri: uri_text,
                    body: response_body,
                };
                // A retryable status on the final attempt of a non-zero
                // budget means the budget was consumed, not that the status
                // is terminal by nature.
                if retryable_class && max_retries > 0 {
                    return Err(Error::RetriesExhausted {
                        max_retries,
                        status: status.as_u16(),
                        source: Box::new(status_error),
                    });
                }
                return Err(status_error);
            }

            self.inner.hooks.run_on_success(&context, status);
            return Ok(Response::new(status, response_headers, response_body));
        }

        // Every classification path above returns or retries within budget,
        // so the loop cannot fall through; keep the terminal shape anyway.
        Err(Error::RetriesExhausted {
            max_retries,
            status: last_status.map_or(0, |s| s.as_u16()),
            source: Box::new(last_error.unwrap_or(Error::Cancelled {
                method,
                uri: uri_text,
            })),
        })
    }

    /// GET `base_url` + `path`.
    pub async fn get(&self, path: &str, token: &CancellationToken) -> crate::Result<Response> {
        let request = self.build_request(Method::GET, path, Body::empty())?;
        self.execute(request, token).await
    }

    /// POST `base_url` + `path` with the given content type and body.
    pub async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: impl Into<Body>,
        token: &CancellationToken,
    ) -> crate::Result<Response> {
        let mut request = self.build_request(Method::POST, path, body.into())?;
        let content_type =
            HeaderValue::from_str(content_type).map_err(|source| Error::InvalidHeaderValue {
                name: CONTENT_TYPE.to_string(),
                source,
            })?;
        request.headers_mut().insert(CONTENT_TYPE, content_type);
        self.execute(request, token).await
    }

    /// Serializes `body` as JSON and sends it to `base_url` + `path`.
    /// Decode the reply with [`Response::json`].
    pub async fn send_json<B>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        token: &CancellationToken,
    ) -> crate::Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_vec(body).map_err(|source| Error::SerializeJson { source })?;
        let mut request = self.build_request(method, path, Body::bytes(payload))?;
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        self.execute(request, token).await
    }

    /// Value copy of the request counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Atomically updates rate and burst and rebases the adaptive original
    /// rate. Enables pacing when it was disabled; a non-positive rate
    /// disables it.
    pub fn set_rate_limit(&self, rps: f64, burst: usize) {
        self.inner.adaptive.set_original(rps, burst);
    }

    /// Current effective (rate, burst). The rate dips below the configured
    /// one while an adaptive reduction is in effect; zero means pacing is
    /// disabled.
    pub fn rate_limit(&self) -> (f64, usize) {
        self.inner.limiter.limit()
    }

    /// Idempotent. Stops the pending adaptive restore; in-flight requests
    /// keep running and new requests still execute, but adaptive reduction
    /// becomes a no-op.
    pub fn close(&self) {
        self.inner.adaptive.close();
    }

    fn build_request(&self, method: Method, path: &str, body: Body) -> crate::Result<Request<Body>> {
        let uri_text = join_base_path(&self.inner.config.base_url, path);
        let uri: Uri = uri_text.parse().map_err(|_| Error::InvalidUri {
            uri: uri_text.clone(),
        })?;
        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        Ok(request)
    }

    async fn pace(
        &self,
        token: &CancellationToken,
        method: &Method,
        uri: &str,
    ) -> crate::Result<()> {
        self.inner.limiter.wait(token).await.map_err(|error| match error {
            WaitError::Cancelled => Error::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            },
            WaitError::Starved => Error::Pacing {
                message: "token bucket has zero burst capacity".to_owned(),
            },
        })
    }

    async fn sleep_cancellable(
        &self,
        delay: Duration,
        token: &CancellationToken,
        method: &Method,
        uri: &str,
    ) -> crate::Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            }),
            _ = sleep(delay) => Ok(()),
        }
    }

    async fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
        token: &CancellationToken,
    ) -> Result<http::Response<TransportBody>, RoundTripFailure> {
        let dispatch = self.inner.transport.round_trip(request);
        match self.inner.config.timeout {
            Some(limit) => {
                tokio::select! {
                    _ = token.cancelled() => Err(RoundTripFailure::Cancelled),
                    outcome = timeout(limit, dispatch) => match outcome {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(source)) => Err(RoundTripFailure::Transport {
                            kind: classify_transport_error(&source),
                            source,
                        }),
                        Err(_) => Err(RoundTripFailure::Transport {
                            kind: TransportErrorKind::Timeout,
                            source: format!("transport timed out after {}ms", limit.as_millis())
                                .into(),
                        }),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => Err(RoundTripFailure::Cancelled),
                    outcome = dispatch => match outcome {
                        Ok(response) => Ok(response),
                        Err(source) => Err(RoundTripFailure::Transport {
                            kind: classify_transport_error(&source),
                            source,
                        }),
                    },
                }
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rate, burst) = self.inner.limiter.limit();
        formatter
            .debug_struct("Client")
            .field("base_url", &self.inner.config.base_url)
            .field("rate", &rate)
            .field("burst", &burst)
            .field("max_retries", &self.inner.config.retry.max_retries())
            .finish_non_exhaustive()
    }
}
