//! Response wrapper with key-path-aware decoding.
//!
//! A [`Response`] is the immutable transport result of one call: status,
//! headers, raw body bytes, and a reference to the originating request.
//! Decoding is pull-based: callers ask for a `T` and the response extracts
//! the sub-document at the request's decoding key path (if any) before
//! deserializing. Validation never happens here; the client runs it before a
//! response is handed out.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, ErrorEnvelope, Request, Result};

/// The raw result of one pipeline call.
///
/// # Examples
///
/// ```
/// use backhaul::{Request, Response};
/// use bytes::Bytes;
/// use http::{HeaderMap, StatusCode};
/// use serde::Deserialize;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Show {
///     id: u64,
///     title: String,
/// }
///
/// let request = Arc::new(Request::get("/shows/7").with_decode_path("data.show"));
/// let body = Bytes::from(r#"{"data":{"show":{"id":7,"title":"Pilot"}}}"#);
/// let response =
///     Response::new(StatusCode::OK, HeaderMap::new(), body, request, 1, Duration::ZERO);
///
/// let show: Show = response.decode().unwrap();
/// assert_eq!(show.id, 7);
/// assert_eq!(show.title, "Pilot");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    /// The HTTP status code.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The raw body bytes.
    pub body: Bytes,

    /// The request that produced this response, as prepared by the
    /// middleware chain for the attempt that succeeded.
    pub request: Arc<Request>,

    /// The number of transport attempts made for this logical call
    /// (`1` when the first attempt succeeded).
    pub attempts: u32,

    /// Total latency of the call, including all retry attempts and any
    /// recovery actions between them.
    pub latency: Duration,
}

impl Response {
    /// Creates a new `Response`. Typically called by the client after a
    /// transport attempt completes; public so middleware can be tested in
    /// isolation.
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request: Arc<Request>,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request,
            attempts,
            latency,
        }
    }

    /// Decodes the payload into `T`.
    ///
    /// If the originating request set a decoding key path, the sub-document
    /// at that dotted path is extracted first; a missing path segment is a
    /// [`Error::Decoding`], never a silent `None`. An empty body decodes as
    /// JSON `null`, so calls without an expected payload decode cleanly into
    /// `()` (or `Option<T>`) while any concrete shape still fails loudly.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let root = self.parse_json()?;
        let key_path = self.request.decode_path();
        let target = match key_path {
            Some(path) => pluck(root, path).ok_or_else(|| {
                self.decoding_error(
                    Some(path),
                    format!("key path `{}` not present in response envelope", path),
                )
            })?,
            None => root,
        };
        serde_json::from_value(target).map_err(|e| self.decoding_error(key_path, e.to_string()))
    }

    /// Attempts to decode the structured error envelope from the body.
    ///
    /// The envelope is accepted at the document root or nested under an
    /// `"error"` key. Returns `None` when the body is not valid JSON or
    /// matches neither shape; validation then reports the generic
    /// invalid-error-format failure instead.
    pub fn error_envelope(&self) -> Option<ErrorEnvelope> {
        let root: Value = serde_json::from_slice(&self.body).ok()?;
        if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(root.clone()) {
            return Some(envelope);
        }
        pluck(root, "error").and_then(|nested| serde_json::from_value(nested).ok())
    }

    /// The body as lossily decoded text, for logging and error reporting.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns a header value by name, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Returns `true` if the call required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    fn parse_json(&self) -> Result<Value> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| self.decoding_error(self.request.decode_path(), e.to_string()))
    }

    fn decoding_error(&self, key_path: Option<&str>, detail: String) -> Error {
        Error::Decoding {
            status: self.status,
            key_path: key_path.map(str::to_string),
            detail,
            raw_body: self.text(),
        }
    }
}

/// Navigates a dotted key path into a JSON document, consuming the document.
///
/// Returns `None` as soon as a segment is missing or the current node is not
/// an object.
fn pluck(mut value: Value, path: &str) -> Option<Value> {
    for segment in path.split('.') {
        value = match value {
            Value::Object(mut map) => map.remove(segment)?,
            _ => return None,
        };
    }
    Some(value)
}
