//! Example demonstrating a streamed multipart upload with progress.
//!
//! This example shows how to:
//! - Describe an upload with a scope-driven MIME type and owner field
//! - Stream a file from disk in 64 KiB chunks
//! - Report fractional progress as the payload is handed to the transport
//!
//! A local mock server plays the backend so the example is self-contained.
//!
//! Run with: `cargo run --example media_upload`

use backhaul::{Client, Multipart, Request, Result, UploadScope};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to see the pipeline's own logging
    tracing_subscriber::fmt()
        .with_env_filter("backhaul=debug,media_upload=info")
        .init();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "upload-183" })))
        .mount(&server)
        .await;

    // Write a throwaway "video" to disk; real callers point at media files.
    let file = tempfile::NamedTempFile::new().map_err(|e| {
        backhaul::Error::Configuration(format!("failed to create temp file: {e}"))
    })?;
    std::fs::write(file.path(), vec![0u8; 750_000]).map_err(|e| {
        backhaul::Error::Configuration(format!("failed to write temp file: {e}"))
    })?;

    let client = Client::builder().base_url(server.uri())?.build()?;

    println!("=== Uploading {} ===", file.path().display());
    let response = client
        .upload_with_progress(
            Request::post("/uploads").with_body_param("caption", "opening night"),
            Multipart::from_file(file.path(), "opening-night.mp4", UploadScope::ShowVideo)
                .with_owner("show-81"),
            |fraction| {
                let percent = (fraction * 100.0).round() as u32;
                println!("  sent {percent:>3}%");
            },
        )
        .await?;

    println!();
    println!("Upload finished with status {}", response.status);
    println!("Server assigned: {}", response.text());
    println!("Latency: {:?}", response.latency);

    Ok(())
}
