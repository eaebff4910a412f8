//! # Error Types (error.rs)
//!
//! Every terminal outcome of a REST call is expressed as a [`RestError`].
//! Retryable conditions (429, 5xx, 405, read failures) are handled inside the
//! requestor and only surface here once the retry budget is spent.
//!
//! ```text
//!     Outcome classes:
//!
//!     parameter ──────► fails in begin(), nothing sent
//!     transport ──────► read errors retried, the rest terminal
//!     protocol (4xx) ─► terminal, body kept for the caller
//!     rate limit (429) ► retried, terminal only when budget exhausted
//!     provider (5xx) ─► retried, terminal only when budget exhausted
//! ```

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RestError>;

/// Errors reported to REST callers.
///
/// Cloneable so a single outcome can be handed to both the response object
/// given to callbacks and the return value of a synchronous call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RestError {
    /// Caller misuse detected before any network activity.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// The request body is present but could not be used as a payload.
    #[error("malformed request payload")]
    MalformedPayload,

    /// Connection-layer failure.
    #[error("transport error: {message}")]
    Transport {
        /// Human readable description from the HTTP stack.
        message: String,
        /// Whether the failure happened while reading and may be retried.
        retryable: bool,
    },

    /// Terminal client error returned by the provider (400, 403, 404, ...).
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response body, usually a JSON error object.
        body: String,
    },

    /// The token was rejected (401).
    #[error("unauthorized: bad or missing token")]
    Unauthorized,

    /// The provider refused the method for this route (405).
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The provider kept answering 429 until the retry budget ran out.
    #[error("rate limited (retry after {retry_after_ms} ms, global: {global})")]
    RateLimited {
        /// Wait requested by the provider, in milliseconds.
        retry_after_ms: u64,
        /// Whether the cooldown applied to every bucket.
        global: bool,
    },

    /// The provider kept failing with a 5xx status.
    #[error("server error: HTTP {status}")]
    Server {
        /// HTTP status code.
        status: u16,
    },

    /// A successful response could not be decoded into the requested type.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The object is not known to the ownership registry.
    #[error("resource is not registered")]
    ResourceUnavailable,

    /// The object is claimed by the caller and cannot be released this way.
    #[error("resource ownership conflict")]
    ResourceOwnership,

    /// The request was canceled before it could complete.
    #[error("request canceled")]
    Canceled,
}

impl RestError {
    /// Returns `true` when the requestor may resend the request after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::Transport { retryable, .. } => *retryable,
            RestError::RateLimited { .. } | RestError::Server { .. } | RestError::MethodNotAllowed => true,
            _ => false,
        }
    }

    /// HTTP status code associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Http { status, .. } | RestError::Server { status } => Some(*status),
            RestError::Unauthorized => Some(401),
            RestError::MethodNotAllowed => Some(405),
            RestError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RestError {
    fn from(err: serde_json::Error) -> Self {
        RestError::Decode(err.to_string())
    }
}
