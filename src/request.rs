//! Request descriptors.
//!
//! A [`Request`] is the immutable description of one logical call: method,
//! path, parameters, headers, encoding, decoding key path, and retry budget.
//! It is built once per call with consuming setters and then shared across
//! every attempt of that call. The retry counter lives in the pipeline's
//! per-call budget, never on the request, so reusing a descriptor across
//! attempts cannot alias mutable state.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// How body parameters are serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Serialize the body parameter map as a JSON object (`application/json`).
    #[default]
    Json,
    /// Serialize the body parameter map as form pairs
    /// (`application/x-www-form-urlencoded`). Null values are omitted.
    UrlEncoded,
}

/// An immutable description of one logical call, including its retries.
///
/// # Examples
///
/// ```
/// use backhaul::Request;
///
/// let request = Request::get("/shows")
///     .with_query("page", "2")
///     .with_query_opt("genre", None::<String>) // omitted from the URL
///     .with_decode_path("data.shows");
///
/// assert_eq!(request.path(), "/shows");
/// assert_eq!(request.max_retries(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: BTreeMap<String, Option<String>>,
    body: serde_json::Map<String, Value>,
    headers: HeaderMap,
    encoding: Encoding,
    decode_path: Option<String>,
    max_retries: u32,
    requires_session: bool,
    fallback: bool,
    cancel: Option<CancellationToken>,
}

impl Request {
    /// Creates a new request with the given method and path.
    ///
    /// Defaults: JSON encoding, no decoding key path, a retry budget of 3,
    /// and `requires_session == true` (most backend calls are authenticated;
    /// login-style calls opt out).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: serde_json::Map::new(),
            headers: HeaderMap::new(),
            encoding: Encoding::Json,
            decode_path: None,
            max_retries: 3,
            requires_session: true,
            fallback: false,
            cancel: None,
        }
    }

    /// Creates a GET request for the given path.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Creates a POST request for the given path.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Creates a PUT request for the given path.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Creates a PATCH request for the given path.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Creates a DELETE request for the given path.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), Some(value.into()));
        self
    }

    /// Adds an optional query parameter.
    ///
    /// A `None` value is omitted from the URL entirely, never emitted as an
    /// empty string.
    pub fn with_query_opt(
        mut self,
        key: impl Into<String>,
        value: Option<impl Into<String>>,
    ) -> Self {
        self.query.insert(key.into(), value.map(Into::into));
        self
    }

    /// Adds one body parameter.
    ///
    /// Body parameters are serialized according to the request's
    /// [`Encoding`] when the method carries a body (never for GET).
    pub fn with_body_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Merges all fields of a serializable value into the body parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the value does not serialize to a
    /// JSON object.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body).map_err(|e| Error::Serialization(e.to_string()))?;
        match value {
            Value::Object(map) => {
                self.body.extend(map);
                Ok(self)
            }
            other => Err(Error::Serialization(format!(
                "request body must serialize to a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Adds a header to the request. Request headers win over the client's
    /// default headers on key collision.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Selects the body encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sets the dotted key path locating the payload inside the response
    /// envelope (e.g. `"data"` or `"data.shows"`).
    pub fn with_decode_path(mut self, path: impl Into<String>) -> Self {
        self.decode_path = Some(path.into());
        self
    }

    /// Sets the retry budget: the maximum number of resubmissions the
    /// pipeline may perform for this call.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Marks whether this call expects an authenticated session.
    ///
    /// The flag is advisory: the pipeline itself never reads it, but session
    /// middleware uses it to decide whether to attach credentials.
    pub fn with_requires_session(mut self, requires_session: bool) -> Self {
        self.requires_session = requires_session;
        self
    }

    /// Attaches a cancellation token.
    ///
    /// The token is checked immediately before every transport submission
    /// and before any recovery side effect; once cancelled, the call fails
    /// with [`Error::Cancelled`] without touching the network.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, relative to the client's base URL.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query parameters. `None` values are omitted at URL build time.
    pub fn query_params(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.query.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// The body parameter map.
    pub fn body_params(&self) -> &serde_json::Map<String, Value> {
        &self.body
    }

    /// The request-specific headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// The decoding key path, if one was set.
    pub fn decode_path(&self) -> Option<&str> {
        self.decode_path.as_deref()
    }

    /// The retry budget for this call.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether this call expects an authenticated session.
    pub fn requires_session(&self) -> bool {
        self.requires_session
    }

    /// Whether this is a recovery request issued by the retry engine.
    ///
    /// Fallback requests bypass the middleware response phase, which is what
    /// prevents a credential-refresh call from triggering its own refresh.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// The cancellation token, if one was attached.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Whether cancellation has been observed for this request.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Marks this request as a recovery request. Only the retry engine does
    /// this, right before dispatching an `AfterRequest` fallback.
    pub(crate) fn into_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Serializes the body parameters for the wire.
    ///
    /// Returns `None` when no body should be sent: GET requests never carry
    /// one, and neither does an empty parameter map. The content type is
    /// returned alongside so the caller only sets it when a body exists.
    pub(crate) fn encoded_body(&self) -> Result<Option<(&'static str, Bytes)>> {
        if self.method == Method::GET || self.body.is_empty() {
            return Ok(None);
        }
        match self.encoding {
            Encoding::Json => {
                let bytes = serde_json::to_vec(&self.body)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(Some(("application/json", Bytes::from(bytes))))
            }
            Encoding::UrlEncoded => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in &self.body {
                    if let Some(text) = form_value(value) {
                        serializer.append_pair(key, &text);
                    }
                }
                Ok(Some((
                    "application/x-www-form-urlencoded",
                    Bytes::from(serializer.finish()),
                )))
            }
        }
    }

    /// The body parameters rendered as plain text fields, in the form the
    /// multipart encoder frames them.
    pub(crate) fn plain_fields(&self) -> Vec<(String, String)> {
        self.body
            .iter()
            .filter_map(|(k, v)| form_value(v).map(|text| (k.clone(), text)))
            .collect()
    }
}

/// Renders a JSON value as a form/multipart field. Strings stay bare
/// (no surrounding quotes), nulls are omitted.
fn form_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_requests_have_no_body() {
        let request = Request::get("/shows").with_body_param("page", 1);
        assert!(request.encoded_body().unwrap().is_none());
    }

    #[test]
    fn test_empty_body_map_has_no_body() {
        let request = Request::post("/shows");
        assert!(request.encoded_body().unwrap().is_none());
    }

    #[test]
    fn test_json_body_encoding() {
        let request = Request::post("/shows")
            .with_body_param("title", "premiere")
            .with_body_param("visible", true);
        let (content_type, bytes) = request.encoded_body().unwrap().unwrap();
        assert_eq!(content_type, "application/json");
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"title": "premiere", "visible": true}));
    }

    #[test]
    fn test_urlencoded_body_skips_nulls() {
        let request = Request::post("/session")
            .with_encoding(Encoding::UrlEncoded)
            .with_body_param("code", "abc d")
            .with_body_param("nonce", Value::Null)
            .with_body_param("ttl", 30);
        let (content_type, bytes) = request.encoded_body().unwrap().unwrap();
        assert_eq!(content_type, "application/x-www-form-urlencoded");
        assert_eq!(&bytes[..], b"code=abc+d&ttl=30" as &[u8]);
    }

    #[test]
    fn test_with_body_merges_object_fields() {
        #[derive(Serialize)]
        struct NewShow {
            title: String,
            episodes: u32,
        }

        let request = Request::post("/shows")
            .with_body(&NewShow {
                title: "pilot".to_string(),
                episodes: 8,
            })
            .unwrap();
        assert_eq!(request.body_params()["title"], json!("pilot"));
        assert_eq!(request.body_params()["episodes"], json!(8));
    }

    #[test]
    fn test_with_body_rejects_non_objects() {
        let err = Request::post("/shows").with_body(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_invalid_header_name() {
        let err = Request::get("/shows").with_header("bad header", "x").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_fallback_marking() {
        let request = Request::post("/auth/refresh").into_fallback();
        assert!(request.is_fallback());
        assert!(!Request::post("/auth/refresh").is_fallback());
    }

    #[test]
    fn test_plain_fields_rendering() {
        let request = Request::post("/upload")
            .with_body_param("name", "clip.mp4")
            .with_body_param("public", false)
            .with_body_param("skip", Value::Null);
        let fields = request.plain_fields();
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), "clip.mp4".to_string()),
                ("public".to_string(), "false".to_string()),
            ]
        );
    }
}
