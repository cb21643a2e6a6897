use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};

/// Per-attempt request metadata handed to callbacks and hooks.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
    attempt: usize,
    max_retries: usize,
}

impl RequestContext {
    pub(crate) fn new(method: Method, uri: String, attempt: usize, max_retries: usize) -> Self {
        Self {
            method,
            uri,
            attempt,
            max_retries,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Zero-based attempt index within the logical request.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }
}

pub(crate) type ErrorCallback = Arc<dyn Fn(StatusCode, &RequestContext) + Send + Sync>;
pub(crate) type SuccessCallback = Arc<dyn Fn(&RequestContext, StatusCode) + Send + Sync>;
pub(crate) type RateLimitedCallback = Arc<dyn Fn(&RequestContext) + Send + Sync>;
pub(crate) type RequestHook = Arc<dyn Fn(&RequestContext, &mut HeaderMap) + Send + Sync>;
pub(crate) type ResponseHook = Arc<dyn Fn(&RequestContext, StatusCode, &HeaderMap) + Send + Sync>;

/// Optional callback slots stored on the client. Each is a plain closure
/// invoked synchronously on the executor's task when present.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_rate_limited: Option<RateLimitedCallback>,
    pub(crate) request_hook: Option<RequestHook>,
    pub(crate) response_hook: Option<ResponseHook>,
}

impl Hooks {
    pub(crate) fn run_on_error(&self, status: StatusCode, context: &RequestContext) {
        if let Some(on_error) = &self.on_error {
            on_error(status, context);
        }
    }

    pub(crate) fn run_on_success(&self, context: &RequestContext, status: StatusCode) {
        if let Some(on_success) = &self.on_success {
            on_success(context, status);
        }
    }

    pub(crate) fn run_on_rate_limited(&self, context: &RequestContext) {
        if let Some(on_rate_limited) = &self.on_rate_limited {
            on_rate_limited(context);
        }
    }

    pub(crate) fn run_request_hook(&self, context: &RequestContext, headers: &mut HeaderMap) {
        if let Some(request_hook) = &self.request_hook {
            request_hook(context, headers);
        }
    }

    pub(crate) fn run_response_hook(
        &self,
        context: &RequestContext,
        status: StatusCode,
        headers: &HeaderMap,
    ) {
        if let Some(response_hook) = &self.response_hook {
            response_hook(context, status, headers);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Hooks")
            .field("on_error", &self.on_error.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_rate_limited", &self.on_rate_limited.is_some())
            .field("request_hook", &self.request_hook.is_some())
            .field("response_hook", &self.response_hook.is_some())
            .finish()
    }
}
