//! `resilient-http` is the request layer of an API client.
//!
//! Every logical call goes through [`ApiClient::send`], which:
//! - fails fast while the per-client [`CircuitBreaker`] is open
//! - retries 429 responses (honouring `Retry-After`) and 5xx responses
//!   within separate budgets
//! - records the backend's rate-limit headers as a [`RateLimitSnapshot`]
//!
//! Long-running operations answered with `202 Accepted` are followed with
//! [`ApiClient::wait_for_async`] or [`ApiClient::send_and_wait`].
//!
//! All waits and attempts are bounded by a [`RequestContext`], which
//! carries the caller's deadline and cancellation token.

mod breaker;
mod client;
mod context;
mod error;
mod options;
mod poller;
mod rate_limit;
mod transport;
mod types;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::ApiClient;
pub use context::RequestContext;
pub use error::Error;
pub use options::{AsyncWaitConfig, ClientOptions, RetryConfig, DEFAULT_POLL_INTERVAL, ENV_PREFIX};
pub use poller::resolve_location;
pub use rate_limit::{retry_after, RateLimitSnapshot, RateLimitTracker};
pub use transport::{HttpTransport, Transport, TransportError};
pub use types::{HttpRequest, Response};

pub type Result<T> = std::result::Result<T, Error>;
