use bytes::Bytes;
use http::{Method, StatusCode};
use thiserror::Error;

use crate::util::truncate_body;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a transport-level failure, derived from the
/// underlying error's text. Drives the default retry decision for attempts
/// that never produced a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Stable machine-readable identifier for each error category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Cancelled,
    Pacing,
    InvalidUri,
    InvalidHeaderValue,
    ReadRequestBody,
    Transport,
    ReadBody,
    BodyTooLarge,
    HttpStatus,
    RetriesExhausted,
    SerializeJson,
    DeserializeJson,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Pacing => "pacing",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::ReadRequestBody => "read_request_body",
            Self::Transport => "transport",
            Self::ReadBody => "read_body",
            Self::BodyTooLarge => "body_too_large",
            Self::HttpStatus => "http_status",
            Self::RetriesExhausted => "retries_exhausted",
            Self::SerializeJson => "serialize_json",
            Self::DeserializeJson => "deserialize_json",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("rate limiter cannot satisfy the request: {message}")]
    Pacing { message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to read request body for {method} {uri}: {source}")]
    ReadRequestBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read response body (status {status}) for {method} {uri}: {source}")]
    ReadBody {
        status: u16,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes, status {status}) for {method} {uri}"
    )]
    BodyTooLarge {
        status: u16,
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status {status} for {method} {uri}: {}", truncate_body(.body))]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: Bytes,
    },
    #[error("max retries ({max_retries}) exceeded with status {status}: {source}")]
    RetriesExhausted {
        max_retries: usize,
        status: u16,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    DeserializeJson {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Pacing { .. } => ErrorCode::Pacing,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::ReadRequestBody { .. } => ErrorCode::ReadRequestBody,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::BodyTooLarge { .. } => ErrorCode::BodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::DeserializeJson { .. } => ErrorCode::DeserializeJson,
        }
    }

    /// The HTTP status observed before the error, when one was seen. A
    /// terminal status error, a failed response read, and an exhausted retry
    /// budget all carry the last status so callers never lose it.
    pub fn status(&self) -> Option<StatusCode> {
        let status = match self {
            Self::ReadBody { status, .. }
            | Self::BodyTooLarge { status, .. }
            | Self::HttpStatus { status, .. }
            | Self::RetriesExhausted { status, .. } => *status,
            _ => return None,
        };
        StatusCode::from_u16(status).ok()
    }

    /// The response body delivered alongside a terminal status error, so
    /// callers can inspect API error payloads.
    pub fn response_body(&self) -> Option<&Bytes> {
        match self {
            Self::HttpStatus { body, .. } => Some(body),
            Self::RetriesExhausted { source, .. } => source.response_body(),
            _ => None,
        }
    }
}
