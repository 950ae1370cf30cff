//! Example demonstrating automatic credential refresh through middleware.
//!
//! This example shows how to:
//! - Attach a bearer token to session-bound requests in the request phase
//! - Answer a 401 with a refresh-then-retry directive
//! - Observe the fallback request and the resubmission in the logs
//!
//! A local mock server plays the backend so the example is self-contained.
//!
//! Run with: `cargo run --example token_refresh`

use async_trait::async_trait;
use backhaul::{Client, Middleware, Request, Response, Result, RetryStrategy, Verdict};
use http::StatusCode;
use serde_json::json;
use std::sync::{Arc, RwLock};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Keeps a bearer token fresh: attaches it to every session-bound request
/// and refreshes it through a fallback request when the backend answers 401.
struct SessionAuth {
    token: Arc<RwLock<String>>,
}

#[async_trait]
impl Middleware for SessionAuth {
    fn applies_to_request(&self, request: &Request) -> bool {
        request.requires_session()
    }

    async fn prepare(&self, request: Request) -> Result<Request> {
        let token = self.token.read().unwrap().clone();
        request.with_header("authorization", format!("Bearer {token}"))
    }

    async fn inspect(&self, response: Response) -> Verdict {
        if response.status != StatusCode::UNAUTHORIZED {
            return Verdict::Pass(response);
        }
        println!("-> got 401, scheduling a token refresh before retrying");
        let slot = self.token.clone();
        Verdict::Retry(RetryStrategy::after_request_with(
            Request::post("/auth/refresh").with_requires_session(false),
            move |refresh| async move {
                if let Ok(token) = refresh.decode::<String>() {
                    println!("-> refresh succeeded, storing the new token");
                    *slot.write().unwrap() = token;
                }
            },
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to see the pipeline's own logging
    tracing_subscriber::fmt()
        .with_env_filter("backhaul=debug,token_refresh=info")
        .init();

    // A mock backend: /shows requires the fresh token, /auth/refresh hands
    // one out.
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(|req: &wiremock::Request| {
            match req.headers.get("authorization") {
                Some(value) if value == "Bearer fresh-token" => ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "data": { "shows": [ { "id": 1, "title": "Pilot" } ] }
                    })),
                _ => ResponseTemplate::new(401).set_body_json(json!({
                    "error": { "message": "session expired", "code": "auth_expired" }
                })),
            }
        })
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("fresh-token")))
        .mount(&server)
        .await;

    // The client starts with a stale token on purpose.
    let token = Arc::new(RwLock::new("stale-token".to_string()));
    let client = Client::builder()
        .base_url(server.uri())?
        .middleware(SessionAuth {
            token: token.clone(),
        })
        .build()?;

    println!("=== Calling /shows with a stale token ===");
    let response = client
        .send(Request::get("/shows").with_decode_path("data.shows"))
        .await?;

    let shows: Vec<serde_json::Value> = response.decode()?;
    println!();
    println!("Fetched {} show(s) in {:?}", shows.len(), response.latency);
    println!("Attempts: {} (was retried: {})", response.attempts, response.was_retried());
    println!("Token after the call: {}", token.read().unwrap());

    Ok(())
}
