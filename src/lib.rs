//! # Backhaul - a retry-aware HTTP request pipeline
//!
//! Backhaul is the request/response pipeline for talking to a JSON backend,
//! built on top of `reqwest`. Callers describe calls as immutable [`Request`]
//! values; the [`Client`] drives each one through an ordered middleware
//! chain and validates the result. When a middleware demands a retry, the
//! client runs the demanded recovery action (a pause, a credential-refresh
//! request, or an arbitrary task) before resubmitting, bounded by a per-call
//! retry budget.
//!
//! ## Quick Start
//!
//! ```no_run
//! use backhaul::{Client, Request, TransientRetry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Show {
//!     id: u64,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), backhaul::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .default_header("x-app-version", "1.4.0")?
//!         .middleware(TransientRetry::new())
//!         .build()?;
//!
//!     // Responses decode on demand; a dotted key path dives into the
//!     // server's response envelope first.
//!     let response = client
//!         .send(Request::get("/shows").with_query("page", "1").with_decode_path("data.shows"))
//!         .await?;
//!     let shows: Vec<Show> = response.decode()?;
//!     println!("fetched {} shows in {:?}", shows.len(), response.latency);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Immutable request descriptors** - One [`Request`] value describes a
//!   call end to end; retry state lives in the pipeline, never on the request
//! - **Middleware chain** - Ordered [`Middleware`] rewrite outgoing requests
//!   and render [`Verdict`]s on responses; the first non-pass verdict wins
//! - **Recovery-aware retries** - [`RetryStrategy`] covers immediate and
//!   delayed resubmission plus out-of-band recovery: a fallback request
//!   (e.g. token refresh) or an arbitrary async task, each bounded by the
//!   request's retry budget
//! - **Keyed decoding** - [`Response::decode`] navigates a dotted key path
//!   into the response envelope before deserializing
//! - **Multipart uploads** - Table-driven [`Multipart`] framing with boundary
//!   collision avoidance, file streaming, and fractional progress reporting
//! - **Structured errors** - An [`Error`] taxonomy that preserves status
//!   codes, decoded error envelopes, and raw bodies for debugging
//! - **Automatic logging** - Structured logging with `tracing` for
//!   observability
//!
//! ## Middleware
//!
//! Middleware is where cross-cutting policy lives. A session middleware, for
//! example, attaches credentials in the request phase and answers a 401 with
//! a refresh-then-retry directive:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use backhaul::{Client, Middleware, Request, Response, Result, RetryStrategy, Verdict};
//! use http::StatusCode;
//! use std::sync::{Arc, RwLock};
//!
//! struct SessionAuth {
//!     token: Arc<RwLock<String>>,
//! }
//!
//! #[async_trait]
//! impl Middleware for SessionAuth {
//!     fn applies_to_request(&self, request: &Request) -> bool {
//!         request.requires_session()
//!     }
//!
//!     async fn prepare(&self, request: Request) -> Result<Request> {
//!         let token = self.token.read().unwrap().clone();
//!         request.with_header("authorization", format!("Bearer {token}"))
//!     }
//!
//!     async fn inspect(&self, response: Response) -> Verdict {
//!         if response.status != StatusCode::UNAUTHORIZED {
//!             return Verdict::Pass(response);
//!         }
//!         let slot = self.token.clone();
//!         Verdict::Retry(RetryStrategy::after_request_with(
//!             Request::post("/auth/refresh").with_requires_session(false),
//!             move |refresh| async move {
//!                 if let Ok(token) = refresh.decode::<String>() {
//!                     *slot.write().unwrap() = token;
//!                 }
//!             },
//!         ))
//!     }
//! }
//! ```
//!
//! The refresh request is dispatched as a *fallback*: it skips the response
//! phase of the chain, so it can never trigger its own refresh. If it fails,
//! the caller sees the original 401, not the refresh failure.
//!
//! ## Error Handling
//!
//! Every failure mode is a distinct [`Error`] variant with the raw response
//! preserved where one existed:
//!
//! ```no_run
//! use backhaul::{Client, Error, Request};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.send(Request::get("/shows/42")).await {
//!     Ok(response) => println!("ok: {}", response.status),
//!     Err(Error::Api { status, envelope }) => {
//!         eprintln!("server rejected the call ({status}): {envelope}");
//!     }
//!     Err(Error::MaxRetriesReached { retries }) => {
//!         eprintln!("gave up after {retries} retries");
//!     }
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod middleware;
mod multipart;
mod request;
mod response;
mod retry;

pub use client::{Client, ClientBuilder};
pub use error::{Error, ErrorEnvelope, Result};
pub use middleware::{Middleware, TransientRetry, Verdict};
pub use multipart::{Multipart, ProgressHandler, UploadScope, UploadSource};
pub use request::{Encoding, Request};
pub use response::Response;
pub use retry::{BoxError, FallbackHandler, RecoveryErrorHandler, RecoveryTask, RetryStrategy};
