use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;

use crate::transport::TransportError;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or request execution error from the transport.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
    /// Non-success final HTTP status with the raw response body.
    #[error("api error {status}: {message}")]
    Api {
        status: u16,
        /// Message extracted from the body, or the trimmed body itself.
        message: String,
        body: String,
    },
    /// Authentication was rejected (401 or 403).
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },
    /// Rate-limit retry budget exhausted on 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// The wait that would have been used before the next attempt.
        retry_after: Duration,
    },
    /// The circuit breaker rejected the call without touching the network.
    #[error("circuit breaker is open, backend is failing; try again later")]
    CircuitOpen,
    /// A failure annotated with the request that produced it.
    #[error("{method} {url}{}: {source}", status_suffix(.status))]
    Request {
        method: Method,
        url: String,
        status: Option<u16>,
        source: Box<Error>,
    },
    /// The async poll loop hit its iteration cap; the operation may still be
    /// running server-side.
    #[error("async operation at {location} still in progress after {iterations} polls")]
    AsyncWaitExceeded { location: String, iterations: usize },
    /// A URL could not be parsed or was rejected.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
    /// The caller's deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The caller cancelled the operation.
    #[error("operation canceled")]
    Canceled,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(status) => format!(" (status {status})"),
        None => String::new(),
    }
}

impl Error {
    /// Returns the innermost error, unwrapping any [`Error::Request`] layers.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Error::Request { source, .. } = current {
            current = source;
        }
        current
    }

    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Request {
                status: Some(status),
                ..
            } => Some(*status),
            Error::Request { source, .. } => source.status(),
            Error::Api { status, .. } | Error::Auth { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root_cause(), Error::CircuitOpen)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root_cause(), Error::DeadlineExceeded)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root_cause(), Error::Canceled)
    }

    /// True for either of the two cancellation kinds.
    pub fn is_cancellation(&self) -> bool {
        self.is_deadline_exceeded() || self.is_canceled()
    }

    /// True when the backend may recover or may still finish the work, so
    /// the caller should try again later rather than treat it as fatal.
    pub fn is_retry_later(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::CircuitOpen | Error::AsyncWaitExceeded { .. } | Error::RateLimited { .. }
        )
    }

    /// Classifies a final non-success response.
    pub(crate) fn from_status(status: u16, body: &[u8]) -> Self {
        let message = error_message(body);
        match status {
            401 | 403 => Error::Auth { status, message },
            _ => Error::Api {
                status,
                message,
                body: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    detail: Option<String>,
}

fn error_message(body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error).or(parsed.detail) {
            return message;
        }
    }
    String::from_utf8_lossy(body).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::Error;
    use reqwest::Method;

    #[test]
    fn message_is_taken_from_json_body() {
        let err = Error::from_status(404, br#"{"message":"widget not found"}"#);
        match err {
            Error::Api {
                status, message, ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(message, "widget not found");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_maps_to_auth() {
        let err = Error::from_status(401, b"  bad token \n");
        assert!(matches!(err, Error::Auth { status: 401, ref message } if message == "bad token"));
    }

    #[test]
    fn request_wrapper_unwraps_to_cause() {
        let err = Error::Request {
            method: Method::GET,
            url: "https://api.test/v1/items".to_owned(),
            status: None,
            source: Box::new(Error::CircuitOpen),
        };
        assert!(err.is_circuit_open());
        assert!(err.is_retry_later());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "GET https://api.test/v1/items: circuit breaker is open, backend is failing; try again later"
        );
    }

    #[test]
    fn status_is_found_through_wrapper() {
        let err = Error::Request {
            method: Method::POST,
            url: "https://api.test/v1/items".to_owned(),
            status: Some(500),
            source: Box::new(Error::from_status(500, b"boom")),
        };
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("(status 500)"));
        assert!(!err.is_cancellation());
    }
}
