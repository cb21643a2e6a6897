use std::error::Error as StdError;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Response body as produced by a transport, boxed so injected transports
/// are not tied to hyper's `Incoming`.
pub type TransportBody = BoxBody<Bytes, BoxError>;

/// A request body. Buffered bodies are replayed as-is on every attempt;
/// streaming bodies are read fully into a buffer once, before the first
/// attempt, so retries can re-send identical bytes.
pub enum Body {
    Empty,
    Buffered(Bytes),
    Streaming(BoxBody<Bytes, BoxError>),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::Buffered(body.into())
    }

    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        Self::Streaming(BodyExt::boxed(StreamBody::new(stream.map(|item| {
            item.map(Frame::data).map_err(|error| Box::new(error) as BoxError)
        }))))
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Empty
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self::Buffered(body)
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(body))
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self::Buffered(Bytes::from(body))
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self::Buffered(Bytes::from_static(body.as_bytes()))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Body::Empty"),
            Self::Buffered(body) => write!(formatter, "Body::Buffered({} bytes)", body.len()),
            Self::Streaming(_) => formatter.write_str("Body::Streaming"),
        }
    }
}

/// Reads the body fully into a buffer for replay across attempts.
pub(crate) async fn capture(body: Body) -> Result<Bytes, BoxError> {
    match body {
        Body::Empty => Ok(Bytes::new()),
        Body::Buffered(body) => Ok(body),
        Body::Streaming(mut body) => {
            let mut collected = Vec::new();
            while let Some(frame) = body.frame().await {
                if let Some(data) = frame?.data_ref() {
                    collected.extend_from_slice(data);
                }
            }
            Ok(Bytes::from(collected))
        }
    }
}

/// Rebuilds the attempt request from the captured parts; hyper derives the
/// content length from the buffered body.
pub(crate) fn attempt_request(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Request<Full<Bytes>> {
    let mut request = Request::new(Full::new(body));
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    request
}

pub(crate) enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
    Cancelled,
}

/// Drains a response body frame by frame, failing once the running total
/// exceeds `max_bytes`. The cancellation token interrupts between frames.
pub(crate) async fn read_body_limited(
    mut body: TransportBody,
    max_bytes: usize,
    token: &CancellationToken,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(ReadBodyError::Cancelled),
            frame = body.frame() => frame,
        };
        let Some(frame) = frame else {
            return Ok(Bytes::from(collected));
        };
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }
}
