//! The middleware chain: request rewriting and response verdicts.
//!
//! Middleware is the extension seam of the pipeline. Each call flows through
//! an ordered chain twice: every eligible middleware may rewrite the
//! outgoing [`Request`] in `prepare`, and after transport each eligible
//! middleware `inspect`s the [`Response`] and answers with a [`Verdict`]:
//! pass it on, fail the call, or demand a retry. The first non-pass verdict
//! short-circuits the chain.
//!
//! Transport failures never produce a response, so they take a separate
//! path: [`Middleware::on_transport_error`] lets a middleware turn a
//! connectivity failure into a retry directive.
//!
//! Recovery requests issued by the retry engine are marked as fallbacks and
//! skip the response phase entirely, so a credential refresh can never
//! trigger its own refresh.

use async_trait::async_trait;
use http::HeaderMap;
use rand::Rng;
use std::time::{Duration, SystemTime};

use crate::{Error, Request, Response, Result, RetryStrategy};

/// A middleware's answer after inspecting a response.
#[derive(Debug)]
pub enum Verdict {
    /// Accept the response (possibly transformed) and continue the chain.
    Pass(Response),
    /// Reject the call with a terminal error.
    Fail(Error),
    /// Run a retry strategy, then resubmit the original request.
    Retry(RetryStrategy),
}

/// A pipeline extension.
///
/// Every method has a pass-through default, so an implementation overrides
/// only the hooks it cares about.
///
/// # Examples
///
/// A middleware that attaches a bearer token to session-bound requests and
/// answers a 401 with a refresh-then-retry directive:
///
/// ```
/// use async_trait::async_trait;
/// use backhaul::{Middleware, Request, Response, Result, RetryStrategy, Verdict};
/// use http::StatusCode;
/// use std::sync::{Arc, RwLock};
///
/// struct SessionAuth {
///     token: Arc<RwLock<String>>,
/// }
///
/// #[async_trait]
/// impl Middleware for SessionAuth {
///     fn applies_to_request(&self, request: &Request) -> bool {
///         request.requires_session()
///     }
///
///     async fn prepare(&self, request: Request) -> Result<Request> {
///         let token = self.token.read().unwrap().clone();
///         request.with_header("authorization", format!("Bearer {token}"))
///     }
///
///     async fn inspect(&self, response: Response) -> Verdict {
///         if response.status != StatusCode::UNAUTHORIZED {
///             return Verdict::Pass(response);
///         }
///         let slot = self.token.clone();
///         Verdict::Retry(RetryStrategy::after_request_with(
///             Request::post("/auth/refresh").with_requires_session(false),
///             move |refresh| async move {
///                 if let Ok(token) = refresh.decode::<String>() {
///                     *slot.write().unwrap() = token;
///                 }
///             },
///         ))
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Whether this middleware participates in the request phase for the
    /// given request. Defaults to `true`.
    fn applies_to_request(&self, request: &Request) -> bool {
        let _ = request;
        true
    }

    /// Whether this middleware participates in the response phase for the
    /// given response. Defaults to `true`.
    fn applies_to_response(&self, response: &Response) -> bool {
        let _ = response;
        true
    }

    /// Rewrites the outgoing request. Runs on every attempt, including
    /// resubmissions and fallback requests, so state refreshed by a recovery
    /// action is picked up here.
    async fn prepare(&self, request: Request) -> Result<Request> {
        Ok(request)
    }

    /// Inspects a response and renders a verdict. Never invoked for
    /// fallback requests.
    async fn inspect(&self, response: Response) -> Verdict {
        Verdict::Pass(response)
    }

    /// Offers a transport failure (no response available) for retry.
    /// `attempt` is the 1-based number of the attempt that failed. The first
    /// middleware returning a strategy wins. Never invoked for fallback
    /// requests.
    async fn on_transport_error(
        &self,
        request: &Request,
        error: &Error,
        attempt: u32,
    ) -> Option<RetryStrategy> {
        let _ = (request, error, attempt);
        None
    }
}

/// Stock middleware that retries transient failures.
///
/// Server errors (5xx), throttling (429), and transport failures are
/// answered with a delayed retry. The delay grows exponentially per attempt
/// with optional jitter, and a server-provided `Retry-After` header (seconds
/// or HTTP-date form) overrides the computed backoff, capped by
/// [`max_delay`](Self::with_max_delay).
///
/// # Examples
///
/// ```
/// use backhaul::TransientRetry;
/// use std::time::Duration;
///
/// let retry = TransientRetry::new()
///     .with_initial_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct TransientRetry {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl TransientRetry {
    /// Creates the middleware with default settings: 250 ms initial delay,
    /// 8 s maximum delay, jitter enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay before the first resubmission.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the ceiling for computed and server-provided delays.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// The backoff before the resubmission following the given 1-based
    /// failed attempt: `initial_delay * 2^(attempt - 1)`, capped at
    /// `max_delay`, scaled by a random factor in `0.5..=1.0` when jitter is
    /// enabled.
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_delay.saturating_mul(multiplier).min(self.max_delay);
        if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }

    /// Parses a `Retry-After` header, accepting both the delta-seconds and
    /// the HTTP-date form, capped at `max_delay`.
    fn retry_after(&self, headers: &HeaderMap) -> Option<Duration> {
        let header = headers.get("retry-after")?.to_str().ok()?;
        let wait = if let Ok(seconds) = header.parse::<u64>() {
            Duration::from_secs(seconds)
        } else {
            let date = httpdate::parse_http_date(header).ok()?;
            date.duration_since(SystemTime::now()).ok()?
        };
        Some(wait.min(self.max_delay))
    }

    fn is_transient(status: http::StatusCode) -> bool {
        status.is_server_error() || status.as_u16() == 429
    }
}

#[async_trait]
impl Middleware for TransientRetry {
    async fn inspect(&self, response: Response) -> Verdict {
        if !Self::is_transient(response.status) {
            return Verdict::Pass(response);
        }
        let delay = self
            .retry_after(&response.headers)
            .unwrap_or_else(|| self.backoff(response.attempts));
        Verdict::Retry(RetryStrategy::Delayed(delay))
    }

    async fn on_transport_error(
        &self,
        _request: &Request,
        error: &Error,
        attempt: u32,
    ) -> Option<RetryStrategy> {
        if error.is_retryable() {
            Some(RetryStrategy::Delayed(self.backoff(attempt)))
        } else {
            None
        }
    }
}
