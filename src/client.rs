//! The pipeline orchestrator.
//!
//! The [`Client`] owns the transport, the configuration, and the middleware
//! chain, and drives every call through the same loop: prepare the request,
//! submit it, collect verdicts, execute retry strategies, and validate the
//! final response. Use [`ClientBuilder`] to configure and create clients.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::multipart::ProgressHandler;
use crate::retry::RetryBudget;
use crate::{Error, Middleware, Multipart, Request, Response, Result, RetryStrategy, Verdict};

/// Default per-attempt timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-attempt timeout for uploads.
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// The entry point for making pipeline calls.
///
/// The client is cheap to clone and designed to be shared: all state lives
/// behind an `Arc`, and every call is an independent future.
///
/// # Examples
///
/// ```no_run
/// use backhaul::{Client, Request, TransientRetry};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Show {
///     id: u64,
///     title: String,
/// }
///
/// # async fn example() -> Result<(), backhaul::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .default_header("x-app-version", "1.4.0")?
///     .middleware(TransientRetry::new())
///     .build()?;
///
/// let response = client
///     .send(Request::get("/shows/42").with_decode_path("data.show"))
///     .await?;
/// let show: Show = response.decode()?;
/// println!("fetched {} in {:?}", show.title, response.latency);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    middleware: Vec<Arc<dyn Middleware>>,
    valid_statuses: RangeInclusive<u16>,
    timeout: Duration,
    upload_timeout: Duration,
}

/// What set the retry engine in motion: the original failed response or the
/// original transport error. Surfaced unchanged when a recovery is abandoned.
enum Trigger {
    Response(Response),
    Transport(Error),
}

/// Outcome of the middleware response phase.
enum Review {
    Accepted(Response),
    Retry(RetryStrategy),
}

/// Outcome of executing a retry strategy.
enum Recovery {
    Resubmit,
    Abandon,
}

/// A multipart payload paired with its optional progress handler.
struct UploadJob {
    upload: Multipart,
    progress: Option<ProgressHandler>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Sends a request through the full pipeline and returns the validated
    /// response.
    ///
    /// The pipeline is: middleware request phase, transport submission,
    /// middleware response phase, retry strategies as directed, and finally
    /// status validation. Decoding is left to the caller via
    /// [`Response::decode`].
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.run(request, None).await
    }

    /// Sends a request carrying a multipart upload.
    ///
    /// The request's body parameters become the upload's plain text fields.
    /// The extended upload timeout applies to each attempt.
    pub async fn upload(&self, request: Request, upload: Multipart) -> Result<Response> {
        self.run(
            request,
            Some(UploadJob {
                upload,
                progress: None,
            }),
        )
        .await
    }

    /// Like [`upload`](Self::upload), reporting fractional progress
    /// (`0.0..=1.0`) as payload chunks are handed to the transport.
    ///
    /// Progress is only reported for file-backed uploads; in-memory payloads
    /// are handed to the transport in one piece.
    pub async fn upload_with_progress(
        &self,
        request: Request,
        upload: Multipart,
        progress: impl Fn(f64) + Send + Sync + 'static,
    ) -> Result<Response> {
        self.run(
            request,
            Some(UploadJob {
                upload,
                progress: Some(Arc::new(progress)),
            }),
        )
        .await
    }

    /// The dispatch loop shared by plain calls, uploads, and fallback
    /// requests.
    async fn run(&self, request: Request, upload: Option<UploadJob>) -> Result<Response> {
        let start = Instant::now();
        let mut budget = RetryBudget::new(request.max_retries());

        loop {
            let attempt = budget.attempt();
            let prepared = self.prepare(request.clone()).await?;

            if prepared.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = self.perform(&prepared, upload.as_ref(), attempt, start).await;
            let (trigger, strategy) = match outcome {
                Ok(response) => {
                    if prepared.is_fallback() {
                        return self.validate(response);
                    }
                    let original = response.clone();
                    match self.review_response(response).await? {
                        Review::Accepted(passed) => return self.validate(passed),
                        Review::Retry(strategy) => {
                            tracing::warn!(
                                status = original.status.as_u16(),
                                attempt = attempt,
                                method = %prepared.method(),
                                path = %prepared.path(),
                                "Middleware requested retry"
                            );
                            (Trigger::Response(original), strategy)
                        }
                    }
                }
                Err(error) => {
                    if prepared.is_fallback() || !matches!(error, Error::Transport(_)) {
                        return Err(error);
                    }
                    tracing::warn!(
                        error = %error,
                        attempt = attempt,
                        method = %prepared.method(),
                        path = %prepared.path(),
                        "Transport attempt failed"
                    );
                    match self.review_failure(&prepared, &error, attempt).await {
                        Some(strategy) => (Trigger::Transport(error), strategy),
                        None => return Err(error),
                    }
                }
            };

            if request.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if budget.is_exhausted() {
                tracing::warn!(
                    retries = budget.used(),
                    path = %request.path(),
                    "Retry budget exhausted"
                );
                return Err(Error::MaxRetriesReached {
                    retries: budget.used(),
                });
            }

            match self.execute_strategy(strategy).await {
                Recovery::Resubmit => {
                    budget.record();
                }
                Recovery::Abandon => return self.surface(trigger),
            }
        }
    }

    /// Folds the middleware request phase over the request, in registration
    /// order.
    async fn prepare(&self, request: Request) -> Result<Request> {
        let mut request = request;
        for middleware in &self.inner.middleware {
            if middleware.applies_to_request(&request) {
                request = middleware.prepare(request).await?;
            }
        }
        Ok(request)
    }

    /// Walks the middleware response phase. The first non-pass verdict
    /// short-circuits the chain.
    async fn review_response(&self, mut response: Response) -> Result<Review> {
        for middleware in &self.inner.middleware {
            if !middleware.applies_to_response(&response) {
                continue;
            }
            match middleware.inspect(response).await {
                Verdict::Pass(passed) => response = passed,
                Verdict::Fail(error) => return Err(error),
                Verdict::Retry(strategy) => return Ok(Review::Retry(strategy)),
            }
        }
        Ok(Review::Accepted(response))
    }

    /// Offers a transport failure to the chain. Request-phase eligibility is
    /// reused here since no response exists to test against.
    async fn review_failure(
        &self,
        request: &Request,
        error: &Error,
        attempt: u32,
    ) -> Option<RetryStrategy> {
        for middleware in &self.inner.middleware {
            if !middleware.applies_to_request(request) {
                continue;
            }
            if let Some(strategy) = middleware.on_transport_error(request, error, attempt).await {
                return Some(strategy);
            }
        }
        None
    }

    /// Performs one transport attempt.
    async fn perform(
        &self,
        request: &Request,
        upload: Option<&UploadJob>,
        attempt: u32,
        start: Instant,
    ) -> Result<Response> {
        let url = self.build_url(request);

        tracing::debug!(
            method = %request.method(),
            url = %url,
            attempt = attempt,
            "Executing request"
        );

        // Default headers first, request-specific headers second, so the
        // request wins on key collision.
        let mut headers = self.inner.default_headers.clone();
        for (name, value) in request.headers() {
            headers.insert(name.clone(), value.clone());
        }

        let body = match upload {
            Some(job) => {
                let (content_type, body) = job
                    .upload
                    .encode(&request.plain_fields(), job.progress.clone())
                    .await?;
                Some((content_type, body))
            }
            None => request.encoded_body()?.map(|(content_type, bytes)| {
                (content_type.to_string(), reqwest::Body::from(bytes))
            }),
        };

        let mut builder = self
            .inner
            .http_client
            .request(request.method().clone(), url);

        // Set the content type only when a body is actually present, and
        // never override one the caller already chose.
        if let Some((content_type, body)) = body {
            if !headers.contains_key(CONTENT_TYPE) {
                let value = HeaderValue::from_str(&content_type)
                    .map_err(|e| Error::Configuration(format!("invalid content type: {}", e)))?;
                headers.insert(CONTENT_TYPE, value);
            }
            builder = builder.body(body);
        }

        let timeout = if upload.is_some() {
            self.inner.upload_timeout
        } else {
            self.inner.timeout
        };

        let response = builder.headers(headers).timeout(timeout).send().await?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.bytes().await?;
        let latency = start.elapsed();

        tracing::info!(
            status = status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            attempt = attempt,
            "Received response"
        );

        Ok(Response::new(
            status,
            response_headers,
            body,
            Arc::new(request.clone()),
            attempt,
            latency,
        ))
    }

    /// Executes a retry strategy, returning whether the original request
    /// should be resubmitted.
    async fn execute_strategy(&self, strategy: RetryStrategy) -> Recovery {
        match strategy {
            RetryStrategy::Immediate => Recovery::Resubmit,
            RetryStrategy::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                Recovery::Resubmit
            }
            RetryStrategy::AfterRequest {
                request,
                delay,
                on_success,
            } => {
                tracing::debug!(path = %request.path(), "Executing recovery request");
                match Box::pin(self.run(request.into_fallback(), None)).await {
                    Ok(response) => {
                        if let Some(handler) = on_success {
                            handler(response).await;
                        }
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        Recovery::Resubmit
                    }
                    Err(recovery_error) => {
                        tracing::warn!(
                            error = %recovery_error,
                            "Recovery request failed - abandoning retry"
                        );
                        Recovery::Abandon
                    }
                }
            }
            RetryStrategy::AfterTask {
                delay,
                task,
                on_error,
            } => match task.await {
                Ok(()) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    Recovery::Resubmit
                }
                Err(recovery_error) => {
                    tracing::warn!(
                        error = %recovery_error,
                        "Recovery task failed - abandoning retry"
                    );
                    if let Some(handler) = on_error {
                        handler(recovery_error).await;
                    }
                    Recovery::Abandon
                }
            },
        }
    }

    /// Surfaces the outcome that triggered an abandoned recovery: the
    /// original response goes through standard validation, the original
    /// transport error is returned unchanged.
    fn surface(&self, trigger: Trigger) -> Result<Response> {
        match trigger {
            Trigger::Response(response) => self.validate(response),
            Trigger::Transport(error) => Err(error),
        }
    }

    /// Checks the response status against the configured valid range,
    /// decoding the structured error envelope on rejection.
    fn validate(&self, response: Response) -> Result<Response> {
        let status = response.status.as_u16();
        if self.inner.valid_statuses.contains(&status) {
            return Ok(response);
        }

        if response.status.is_client_error() {
            tracing::error!(
                status = status,
                response = %response.text(),
                "Client error (4xx)"
            );
        } else if response.status.is_server_error() {
            tracing::warn!(
                status = status,
                response = %response.text(),
                "Server error (5xx)"
            );
        }

        match response.error_envelope() {
            Some(envelope) => Err(Error::Api {
                status: response.status,
                envelope,
            }),
            None => Err(Error::InvalidErrorFormat {
                status: response.status,
                raw_body: response.text(),
            }),
        }
    }

    /// Joins the base URL with the request path and its `Some`-valued query
    /// parameters.
    fn build_url(&self, request: &Request) -> Url {
        let mut url = self.inner.base_url.clone();
        url.set_path(request.path());
        if request.query_params().any(|(_, value)| value.is_some()) {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in request.query_params() {
                if let Some(value) = value {
                    pairs.append_pair(key, value);
                }
            }
        }
        url
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("middleware", &self.inner.middleware.len())
            .field("valid_statuses", &self.inner.valid_statuses)
            .field("timeout", &self.inner.timeout)
            .field("upload_timeout", &self.inner.upload_timeout)
            .finish()
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use backhaul::{ClientBuilder, TransientRetry};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), backhaul::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .default_header("user-agent", "my-app/1.0")?
///     .middleware(TransientRetry::new())
///     .valid_statuses(200..=299)
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    middleware: Vec<Arc<dyn Middleware>>,
    valid_statuses: RangeInclusive<u16>,
    timeout: Duration,
    upload_timeout: Duration,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings: statuses
    /// 200–299 valid, 30 s attempt timeout, 5 min upload timeout, no
    /// middleware.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            middleware: Vec::new(),
            valid_statuses: 200..=299,
            timeout: DEFAULT_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header included in all requests. Request-specific
    /// headers win on collision.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Appends a middleware to the chain. Middleware runs in registration
    /// order in both the request and the response phase.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Appends an already shared middleware to the chain.
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Sets the status range accepted by validation.
    pub fn valid_statuses(mut self, statuses: RangeInclusive<u16>) -> Self {
        self.valid_statuses = statuses;
        self
    }

    /// Sets the per-attempt timeout for plain calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-attempt timeout for uploads.
    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided or the transport could
    /// not be constructed.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::Configuration("base URL is required".to_string()))?;

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                default_headers: self.default_headers,
                middleware: self.middleware,
                valid_statuses: self.valid_statuses,
                timeout: self.timeout,
                upload_timeout: self.upload_timeout,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransientRetry;
    use bytes::Bytes;
    use http::StatusCode;

    fn test_client() -> Client {
        Client::builder()
            .base_url("https://api.example.com")
            .unwrap()
            .build()
            .unwrap()
    }

    fn response(status: StatusCode, body: &str) -> Response {
        Response::new(
            status,
            HeaderMap::new(),
            Bytes::copy_from_slice(body.as_bytes()),
            Arc::new(Request::get("/shows")),
            1,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_build_url_with_query_params() {
        let client = test_client();
        let request = Request::get("/shows")
            .with_query("page", "2")
            .with_query_opt("genre", None::<String>);
        assert_eq!(
            client.build_url(&request).as_str(),
            "https://api.example.com/shows?page=2"
        );
    }

    #[test]
    fn test_build_url_without_query() {
        let client = test_client();
        let request = Request::get("/shows/42");
        assert_eq!(
            client.build_url(&request).as_str(),
            "https://api.example.com/shows/42"
        );
    }

    #[test]
    fn test_validate_accepts_success_range() {
        let client = test_client();
        assert!(client.validate(response(StatusCode::OK, "{}")).is_ok());
        assert!(client
            .validate(response(StatusCode::NO_CONTENT, ""))
            .is_ok());
    }

    #[test]
    fn test_validate_decodes_error_envelope() {
        let client = test_client();
        let err = client
            .validate(response(
                StatusCode::NOT_FOUND,
                r#"{"error":{"message":"show not found","code":"show_missing"}}"#,
            ))
            .unwrap_err();
        match err {
            Error::Api { status, envelope } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(envelope.message, "show not found");
                assert_eq!(envelope.code.as_deref(), Some("show_missing"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_invalid_error_format() {
        let client = test_client();
        let err = client
            .validate(response(StatusCode::BAD_GATEWAY, "<html>oops</html>"))
            .unwrap_err();
        match err {
            Error::InvalidErrorFormat { status, raw_body } => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert_eq!(raw_body, "<html>oops</html>");
            }
            other => panic!("Expected InvalidErrorFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_valid_status_range() {
        let client = Client::builder()
            .base_url("https://api.example.com")
            .unwrap()
            .valid_statuses(200..=404)
            .build()
            .unwrap();
        assert!(client
            .validate(response(StatusCode::NOT_FOUND, "{}"))
            .is_ok());
    }

    #[test]
    fn test_build_requires_base_url() {
        let err = Client::builder().build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_debug_elides_middleware() {
        let client = Client::builder()
            .base_url("https://api.example.com")
            .unwrap()
            .middleware(TransientRetry::new())
            .build()
            .unwrap();
        let rendered = format!("{:?}", client);
        assert!(rendered.contains("base_url: \"https://api.example.com/\""));
        assert!(rendered.contains("middleware: 1"));
    }
}
