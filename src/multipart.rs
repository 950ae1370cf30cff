//! `multipart/form-data` encoding for binary uploads.
//!
//! A [`Multipart`] describes one binary payload: its bytes (in memory or on
//! disk), a filename, an [`UploadScope`] that fixes the MIME type and the
//! owner-field name, and an optional owner identifier. The encoder frames
//! the request's plain body parameters as text fields, then the binary part
//! (always named `file`), then the closing boundary, with CRLF line endings
//! throughout. Quotes and backslashes in part names and filenames are
//! escaped, and ASCII control characters are dropped.
//!
//! In-memory payloads are framed into a single buffer under a boundary that
//! is regenerated until it collides with neither the payload nor any field.
//! File payloads keep the identical prologue and epilogue bytes but stream
//! the file through a 64 KiB chunked reader, reporting fractional progress
//! as chunks are handed to the transport.

use bytes::Bytes;
use futures::{future, stream, StreamExt};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::io::ReaderStream;

use crate::{Error, Result};

/// File bytes are streamed in chunks of this size.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Receives the fraction of the payload handed to the transport so far,
/// from `0.0` to `1.0`.
pub type ProgressHandler = Arc<dyn Fn(f64) + Send + Sync>;

/// Where the binary payload comes from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// The payload is already in memory.
    Data(Bytes),
    /// The payload is read from disk at encode time.
    File(PathBuf),
}

/// What is being uploaded. The scope fixes the payload's MIME type and the
/// name of the owner field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadScope {
    /// A user avatar (`image/jpeg`, owned by a `user`).
    ProfilePicture,
    /// A full show video (`video/mp4`, owned by a `show`).
    ShowVideo,
    /// A short show teaser (`video/mp4`, owned by a `show`).
    ShowTeaser,
    /// A product photo (`image/jpeg`, owned by a `product`).
    ProductPhoto,
}

impl UploadScope {
    /// The MIME type declared for the binary part.
    pub fn mime_type(&self) -> &'static str {
        match self {
            UploadScope::ProfilePicture | UploadScope::ProductPhoto => "image/jpeg",
            UploadScope::ShowVideo | UploadScope::ShowTeaser => "video/mp4",
        }
    }

    /// The field name the owner identifier is sent under.
    pub fn owner_field(&self) -> &'static str {
        match self {
            UploadScope::ProfilePicture => "user",
            UploadScope::ShowVideo | UploadScope::ShowTeaser => "show",
            UploadScope::ProductPhoto => "product",
        }
    }
}

/// A binary upload descriptor.
///
/// Cloneable and re-encodable: every retry attempt frames the payload from
/// scratch under a fresh boundary (and re-opens the file for file-backed
/// sources).
///
/// # Examples
///
/// ```
/// use backhaul::{Multipart, UploadScope};
///
/// let upload = Multipart::from_file("/tmp/teaser.mp4", "teaser.mp4", UploadScope::ShowTeaser)
///     .with_owner("show-81");
/// assert_eq!(upload.scope().mime_type(), "video/mp4");
/// ```
#[derive(Debug, Clone)]
pub struct Multipart {
    source: UploadSource,
    filename: String,
    scope: UploadScope,
    owner: Option<String>,
}

impl Multipart {
    /// An upload whose payload is already in memory.
    pub fn from_bytes(
        data: impl Into<Bytes>,
        filename: impl Into<String>,
        scope: UploadScope,
    ) -> Self {
        Self {
            source: UploadSource::Data(data.into()),
            filename: filename.into(),
            scope,
            owner: None,
        }
    }

    /// An upload whose payload is read from disk at send time.
    pub fn from_file(
        path: impl Into<PathBuf>,
        filename: impl Into<String>,
        scope: UploadScope,
    ) -> Self {
        Self {
            source: UploadSource::File(path.into()),
            filename: filename.into(),
            scope,
            owner: None,
        }
    }

    /// Attaches the owner identifier, sent as a text field named by the
    /// scope's owner-field table.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// The payload source.
    pub fn source(&self) -> &UploadSource {
        &self.source
    }

    /// The filename declared for the binary part.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The upload scope.
    pub fn scope(&self) -> UploadScope {
        self.scope
    }

    /// The owner identifier, if one was attached.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Frames the upload, returning the `Content-Type` header value and the
    /// request body.
    ///
    /// `fields` are the request's plain body parameters; the owner field is
    /// appended here. In-memory payloads produce a buffered body; file
    /// payloads produce a streaming body that reports progress through
    /// `progress` as chunks are handed to the transport.
    pub(crate) async fn encode(
        &self,
        fields: &[(String, String)],
        progress: Option<ProgressHandler>,
    ) -> Result<(String, reqwest::Body)> {
        let mut fields = fields.to_vec();
        if let Some(owner) = &self.owner {
            fields.push((self.scope.owner_field().to_string(), owner.clone()));
        }

        match &self.source {
            UploadSource::Data(data) => {
                let boundary = boundary_for(data, &fields);
                let prologue =
                    frame_prologue(&boundary, &fields, &self.filename, self.scope.mime_type());
                let epilogue = frame_epilogue(&boundary);

                let mut payload = Vec::with_capacity(prologue.len() + data.len() + epilogue.len());
                payload.extend_from_slice(&prologue);
                payload.extend_from_slice(data);
                payload.extend_from_slice(&epilogue);

                Ok((content_type(&boundary), reqwest::Body::from(payload)))
            }
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| unreadable(path, &e))?;
                let file_len = file.metadata().await.map_err(|e| unreadable(path, &e))?.len();

                let boundary = generate_boundary();
                let prologue = Bytes::from(frame_prologue(
                    &boundary,
                    &fields,
                    &self.filename,
                    self.scope.mime_type(),
                ));
                let epilogue = Bytes::from(frame_epilogue(&boundary));
                let total = prologue.len() as u64 + file_len + epilogue.len() as u64;

                let chunks = stream::once(future::ready(Ok(prologue)))
                    .chain(ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE))
                    .chain(stream::once(future::ready(Ok(epilogue))));

                let mut sent = 0u64;
                let counted = chunks.map(move |chunk: std::io::Result<Bytes>| {
                    if let Ok(bytes) = &chunk {
                        sent += bytes.len() as u64;
                        if let Some(report) = &progress {
                            report((sent as f64 / total as f64).min(1.0));
                        }
                    }
                    chunk
                });

                Ok((content_type(&boundary), reqwest::Body::wrap_stream(counted)))
            }
        }
    }
}

fn unreadable(path: &Path, error: &std::io::Error) -> Error {
    Error::Configuration(format!(
        "cannot read upload file {}: {}",
        path.display(),
        error
    ))
}

fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

/// One boundary candidate: fixed prefix, 64 bits of entropy, and the
/// current millisecond timestamp.
fn generate_boundary() -> String {
    let entropy: u64 = rand::thread_rng().gen();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("----backhaul-{entropy:016x}-{millis:x}")
}

/// Generates a boundary that appears in neither the payload nor any field
/// name or value. Only in-memory payloads are scanned; a file's bytes are
/// not read ahead of streaming.
fn boundary_for(payload: &[u8], fields: &[(String, String)]) -> String {
    loop {
        let boundary = generate_boundary();
        if !collides(&boundary, payload, fields) {
            return boundary;
        }
    }
}

fn collides(boundary: &str, payload: &[u8], fields: &[(String, String)]) -> bool {
    let needle = boundary.as_bytes();
    payload.windows(needle.len()).any(|window| window == needle)
        || fields
            .iter()
            .any(|(name, value)| name.contains(boundary) || value.contains(boundary))
}

/// Everything before the payload bytes: one text part per field, then the
/// binary part's headers.
fn frame_prologue(
    boundary: &str,
    fields: &[(String, String)],
    filename: &str,
    mime_type: &str,
) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in fields {
        buf.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape(name)
            )
            .as_bytes(),
        );
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    buf.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            escape(filename)
        )
        .as_bytes(),
    );
    buf.extend_from_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    buf
}

/// Everything after the payload bytes: the closing boundary.
fn frame_epilogue(boundary: &str) -> Vec<u8> {
    format!("\r\n--{boundary}--\r\n").into_bytes()
}

/// Escapes `"` and `\` for use inside a quoted Content-Disposition value.
/// ASCII control characters are dropped: a raw CR or LF would break out of
/// the part headers.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            ch if ch.is_ascii_control() => {}
            ch => escaped.push(ch),
        }
    }
    escaped
}
