//! Integration tests for the core pipeline using wiremock: request
//! construction, header merging, body encoding, keyed decoding, and
//! status validation.

use async_trait::async_trait;
use backhaul::{Client, Encoding, Error, Middleware, Request, Response, Verdict};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Show {
    id: u64,
    title: String,
}

async fn client_for(mock_server: &MockServer) -> Client {
    Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_get_decodes_keyed_payload() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "shows": [ { "id": 1, "title": "Pilot" }, { "id": 2, "title": "Finale" } ] }
        })))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let response = client
        .send(
            Request::get("/shows")
                .with_query("page", "2")
                .with_decode_path("data.shows"),
        )
        .await
        .unwrap();

    let shows: Vec<Show> = response.decode().unwrap();
    assert_eq!(shows.len(), 2);
    assert_eq!(shows[0].title, "Pilot");
    assert_eq!(response.attempts, 1);
    assert!(!response.was_retried());
}

#[tokio::test]
async fn test_none_query_params_are_omitted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    client
        .send(
            Request::get("/shows")
                .with_query("page", "1")
                .with_query_opt("genre", None::<String>),
        )
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap();
    assert!(query.contains("page=1"));
    assert!(!query.contains("genre"));
}

#[tokio::test]
async fn test_post_sends_body_map_as_json() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/shows"))
        .and(body_json(json!({ "title": "premiere", "episodes": 8 })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "id": 7, "title": "premiere" })),
        )
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let response = client
        .send(
            Request::post("/shows")
                .with_body_param("title", "premiere")
                .with_body_param("episodes", 8),
        )
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 201);
    let show: Show = response.decode().unwrap();
    assert_eq!(show.id, 7);
}

#[tokio::test]
async fn test_urlencoded_body_content_type() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    client
        .send(
            Request::post("/session")
                .with_encoding(Encoding::UrlEncoded)
                .with_body_param("code", "abc")
                .with_body_param("ttl", 30),
        )
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let content_type = requests[0].headers.get("content-type").unwrap();
    assert_eq!(content_type, "application/x-www-form-urlencoded");
    assert_eq!(requests[0].body, b"code=abc&ttl=30");
}

#[tokio::test]
async fn test_get_requests_have_no_body_or_content_type() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    client
        .send(Request::get("/shows").with_body_param("ignored", true))
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert!(requests[0].body.is_empty());
    assert!(requests[0].headers.get("content-type").is_none());
}

#[tokio::test]
async fn test_request_headers_win_over_defaults() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .default_header("x-api-key", "default")
        .unwrap()
        .default_header("x-app-version", "1.4.0")
        .unwrap()
        .build()
        .unwrap();

    client
        .send(
            Request::get("/shows")
                .with_header("x-api-key", "per-request")
                .unwrap(),
        )
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get("x-api-key").unwrap(), "per-request");
    assert_eq!(requests[0].headers.get("x-app-version").unwrap(), "1.4.0");
}

#[tokio::test]
async fn test_empty_204_decodes_into_unit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/shows/7"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let response = client.send(Request::delete("/shows/7")).await.unwrap();

    assert_eq!(response.status.as_u16(), 204);
    response.decode::<()>().unwrap();
    assert_eq!(response.decode::<Option<Show>>().unwrap(), None);
}

#[tokio::test]
async fn test_structured_error_body_becomes_api_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "message": "show not found", "code": "show_missing" }
        })))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let err = client.send(Request::get("/shows/404")).await.unwrap_err();

    match err {
        Error::Api { status, envelope } => {
            assert_eq!(status.as_u16(), 404);
            assert_eq!(envelope.message, "show not found");
            assert_eq!(envelope.code.as_deref(), Some("show_missing"));
        }
        other => panic!("Expected Api error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unstructured_error_body_is_invalid_format() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let err = client.send(Request::get("/shows")).await.unwrap_err();

    match err {
        Error::InvalidErrorFormat { status, raw_body } => {
            assert_eq!(status.as_u16(), 502);
            assert!(raw_body.contains("bad gateway"));
        }
        other => panic!("Expected InvalidErrorFormat, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_key_path_is_decoding_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server).await;
    let response = client
        .send(Request::get("/shows").with_decode_path("data.shows"))
        .await
        .unwrap();

    let err = response.decode::<Vec<Show>>().unwrap_err();
    match err {
        Error::Decoding { key_path, .. } => {
            assert_eq!(key_path.as_deref(), Some("data.shows"));
        }
        other => panic!("Expected Decoding error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_valid_status_range() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "id": 0, "title": "none" })))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .valid_statuses(200..=404)
        .build()
        .unwrap();

    let response = client.send(Request::get("/shows/404")).await.unwrap();
    assert_eq!(response.status.as_u16(), 404);
}

#[tokio::test]
async fn test_cancelled_requests_never_reach_transport() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let token = CancellationToken::new();
    token.cancel();

    let client = client_for(&mock_server).await;
    let err = client
        .send(Request::get("/shows").with_cancel_token(token))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_concurrent_requests() {
    let mock_server = MockServer::start().await;

    for id in 1..=3u64 {
        Mock::given(method("GET"))
            .and(path(format!("/shows/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "show": { "id": id, "title": format!("Show {id}") } }
            })))
            .mount(&mock_server)
            .await;
    }

    // One client, three independent calls in flight at once, each with its
    // own Request instance.
    let client = client_for(&mock_server).await;
    let fetch = |id: u64| {
        let client = client.clone();
        async move {
            client
                .send(Request::get(format!("/shows/{id}")).with_decode_path("data.show"))
                .await
                .unwrap()
                .decode::<Show>()
                .unwrap()
        }
    };

    let (first, second, third) = tokio::join!(fetch(1), fetch(2), fetch(3));

    assert_eq!(first, Show { id: 1, title: "Show 1".to_string() });
    assert_eq!(second, Show { id: 2, title: "Show 2".to_string() });
    assert_eq!(third, Show { id: 3, title: "Show 3".to_string() });
}

struct Stamp;

#[async_trait]
impl Middleware for Stamp {
    async fn prepare(&self, request: Request) -> backhaul::Result<Request> {
        request.with_header("x-stamped", "yes")
    }
}

#[tokio::test]
async fn test_prepare_middleware_rewrites_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .middleware(Stamp)
        .build()
        .unwrap();

    client.send(Request::get("/shows")).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get("x-stamped").unwrap(), "yes");
}

struct AlwaysFail;

#[async_trait]
impl Middleware for AlwaysFail {
    async fn inspect(&self, _response: Response) -> Verdict {
        Verdict::Fail(Error::Configuration("rejected by policy".to_string()))
    }
}

struct MustNotRun {
    consulted: Arc<AtomicBool>,
}

#[async_trait]
impl Middleware for MustNotRun {
    async fn inspect(&self, response: Response) -> Verdict {
        self.consulted.store(true, Ordering::SeqCst);
        Verdict::Pass(response)
    }
}

#[tokio::test]
async fn test_fail_verdict_short_circuits_chain() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let consulted = Arc::new(AtomicBool::new(false));
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .middleware(AlwaysFail)
        .middleware(MustNotRun {
            consulted: consulted.clone(),
        })
        .build()
        .unwrap();

    let err = client.send(Request::get("/shows")).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(!consulted.load(Ordering::SeqCst));
}
