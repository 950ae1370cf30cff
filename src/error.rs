//! Error types for the request pipeline.
//!
//! This module provides the error taxonomy every pipeline stage reports into.
//! Errors preserve maximum debugging information (status codes, raw bodies,
//! decode key paths) while remaining ergonomic to match on.

use http::StatusCode;
use serde::Deserialize;

/// The structured error body servers return for out-of-range status codes.
///
/// The envelope is expected either at the document root or nested under an
/// `"error"` key:
///
/// ```json
/// { "error": { "message": "show not found", "code": "show_missing" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorEnvelope {
    /// Human-readable description of the failure.
    pub message: String,
    /// Machine-readable error code, when the backend provides one.
    #[serde(default)]
    pub code: Option<String>,
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The main error type for pipeline calls.
///
/// # Examples
///
/// ```no_run
/// use backhaul::{Client, Error, Request};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.send(Request::get("/shows/42")).await {
///     Ok(response) => println!("status {}", response.status),
///     Err(Error::Api { status, envelope }) => {
///         eprintln!("server rejected the call ({status}): {envelope}");
///     }
///     Err(Error::MaxRetriesReached { retries }) => {
///         eprintln!("gave up after {retries} retries");
///     }
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A transport-level failure: connection refused, DNS lookup failed, or
    /// the per-attempt timeout expired.
    ///
    /// Timeouts deliberately share this variant: timeout expiry is a normal
    /// transport failure, eligible for the same middleware and retry handling
    /// as any other. Use [`Error::is_timeout`] to distinguish them.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered outside the valid status range with a body that
    /// decoded into the structured [`ErrorEnvelope`].
    #[error("HTTP {status}: {envelope}")]
    Api {
        /// The HTTP status code.
        status: StatusCode,
        /// The decoded application error.
        envelope: ErrorEnvelope,
    },

    /// The server answered outside the valid status range and the body did
    /// not match the structured error envelope.
    #[error("HTTP {status} with unrecognized error body")]
    InvalidErrorFormat {
        /// The HTTP status code.
        status: StatusCode,
        /// The raw response body, lossily decoded for debugging.
        raw_body: String,
    },

    /// The retry budget was exhausted: another retry directive arrived after
    /// the request had already been resubmitted `retries` times.
    #[error("max retries reached after {retries} resubmissions")]
    MaxRetriesReached {
        /// The number of resubmissions performed before giving up.
        retries: u32,
    },

    /// The response body (or the sub-document at the decoding key path) did
    /// not match the expected shape.
    ///
    /// Decoding errors are terminal and never retried; a malformed payload
    /// will not become well-formed by resending the request.
    #[error("failed to decode response (status {status}): {detail}")]
    Decoding {
        /// The HTTP status code of the response being decoded.
        status: StatusCode,
        /// The decoding key path in effect, if any.
        key_path: Option<String>,
        /// What went wrong (serde error text or the missing path segment).
        detail: String,
        /// The raw response body, lossily decoded for debugging.
        raw_body: String,
    },

    /// The call was cancelled before submission.
    ///
    /// Cancellation is checked immediately before every transport attempt and
    /// before any recovery side effect, so a cancelled call performs no
    /// transport traffic and consumes no retry budget.
    #[error("request cancelled")]
    Cancelled,

    /// A request body value could not be serialized.
    #[error("failed to serialize request body: {0}")]
    Serialization(String),

    /// Invalid client or request configuration (bad header name, missing
    /// base URL, unreadable upload file).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An invalid URL was provided.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns `true` if this error is worth offering to a retry middleware.
    ///
    /// Transport failures and 5xx/429 status errors qualify; decoding
    /// failures, cancellation, and construction errors do not.
    ///
    /// # Examples
    ///
    /// ```
    /// use backhaul::Error;
    /// use http::StatusCode;
    ///
    /// let err = Error::InvalidErrorFormat {
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     raw_body: "<html>".to_string(),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::InvalidErrorFormat {
    ///     status: StatusCode::BAD_REQUEST,
    ///     raw_body: "<html>".to_string(),
    /// };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Api { status, .. } | Error::InvalidErrorFormat { status, .. } => {
                status.is_server_error() || status.as_u16() == 429
            }
            Error::MaxRetriesReached { .. }
            | Error::Decoding { .. }
            | Error::Cancelled
            | Error::Serialization(_)
            | Error::Configuration(_)
            | Error::InvalidUrl(_) => false,
        }
    }

    /// Returns `true` if this is a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(e) if e.is_timeout())
    }

    /// Returns the HTTP status code if this error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api { status, .. }
            | Error::InvalidErrorFormat { status, .. }
            | Error::Decoding { status, .. } => Some(*status),
            Error::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error preserved one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::InvalidErrorFormat { raw_body, .. } => Some(raw_body),
            Error::Decoding { raw_body, .. } => Some(raw_body),
            _ => None,
        }
    }

    /// Returns the decoded application error envelope, when present.
    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            Error::Api { envelope, .. } => Some(envelope),
            _ => None,
        }
    }
}

/// A specialized `Result` type for pipeline calls.
pub type Result<T> = std::result::Result<T, Error>;
