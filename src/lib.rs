//! `tenax` is a resilient HTTP client for third-party JSON/REST APIs that
//! must stay correct and polite under backpressure.
//!
//! It wraps a single HTTP transport with three coupled mechanisms:
//!
//! - Proactive pacing via a token-bucket rate limiter
//! - Bounded retry with exponential backoff and symmetric jitter, honoring
//!   `Retry-After` hints for observability
//! - Adaptive rate reduction on rate-limit responses (halves the rate,
//!   restores it after a quiet cooldown)
//!
//! plus atomic request statistics and per-attempt callbacks and hooks.
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use serde::Deserialize;
//! use tenax::{CancellationToken, Client};
//!
//! #[derive(Debug, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! let client = Client::builder()
//!     .base_url("https://api.example.com")
//!     .rate_limit(5.0, 2)
//!     .retry(3, Duration::from_secs(2))
//!     .adaptive_cooldown(Duration::from_secs(300))
//!     .build();
//!
//! let token = CancellationToken::new();
//! let user: User = client.get("/v1/users/42", &token).await?.json()?;
//! println!("hello {}", user.name);
//!
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! Every suspension point (limiter wait, backoff sleep, round trip, body
//! read) honors the caller's [`CancellationToken`]. One `Client` per
//! upstream API: each owns its own pacing budget, adaptive state, and
//! counters.

mod adaptive;
mod body;
mod client;
mod core;
mod rate_limit;
mod response;
mod transport;

pub(crate) use crate::core::config;
pub(crate) use crate::core::error;
pub(crate) use crate::core::hooks;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::stats;
pub(crate) use crate::core::util;

pub use crate::body::{Body, TransportBody};
pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::hooks::RequestContext;
pub use crate::response::Response;
pub use crate::retry::{RetryClassifier, RetryDecision};
pub use crate::stats::StatsSnapshot;
pub use crate::transport::{HttpTransport, HyperTransport};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;
