use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::{BoxError, TransportErrorKind};

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One HTTP round trip: fully formed request in, response head plus body
/// stream out. Implementations are expected to be internally thread-safe
/// and to own connection pooling, TLS, and redirects.
///
/// The executor wraps calls in its per-attempt timeout only for the built-in
/// transport; an injected implementation owns its own deadline behavior.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<http::Response<crate::body::TransportBody>, BoxError>;
}

/// Default transport: a pooled hyper client over rustls (webpki roots,
/// HTTP/1.1 and HTTP/2, plain-http permitted for local endpoints).
pub struct HyperTransport {
    inner: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_all_versions()
            .build();
        let inner = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .build(connector);
        Self { inner }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<http::Response<crate::body::TransportBody>, BoxError> {
        let response = self.inner.request(request).await?;
        Ok(response.map(|body| body.map_err(|error| Box::new(error) as BoxError).boxed()))
    }
}

/// Classifies a transport failure by walking the source chain and matching
/// well-known error text. Conservative: anything unrecognized is `Other`.
pub(crate) fn classify_transport_error(error: &BoxError) -> TransportErrorKind {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push(' ');
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }
    classify_transport_error_text(&text)
}

pub(crate) fn classify_transport_error_text(text: &str) -> TransportErrorKind {
    const DNS_MARKERS: &[&str] = &[
        "dns",
        "failed to lookup address",
        "name or service not known",
        "no such host",
    ];
    const TLS_MARKERS: &[&str] = &["tls", "ssl", "certificate", "handshake"];
    const CONNECT_MARKERS: &[&str] = &[
        "connection refused",
        "connect error",
        "network unreachable",
        "host unreachable",
    ];
    const READ_MARKERS: &[&str] = &[
        "connection reset",
        "broken pipe",
        "unexpected eof",
        "incomplete message",
        "connection closed before message completed",
    ];

    if contains_marker(text, DNS_MARKERS) {
        return TransportErrorKind::Dns;
    }
    if contains_marker(text, TLS_MARKERS) {
        return TransportErrorKind::Tls;
    }
    if contains_marker(text, CONNECT_MARKERS) {
        return TransportErrorKind::Connect;
    }
    if contains_marker(text, READ_MARKERS) {
        return TransportErrorKind::Read;
    }
    if contains_marker(text, &["timed out", "timeout"]) {
        return TransportErrorKind::Timeout;
    }
    TransportErrorKind::Other
}

fn contains_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| text.contains(marker))
}
