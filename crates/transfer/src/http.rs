//! Seams to the surrounding SDK.
//!
//! The engine does not talk to the network itself. It builds
//! [`HttpRequest`]s and hands them to an [`HttpExecutor`], and asks a
//! [`TransferApi`] for upload/download specifications. Keeping these as
//! traits lets tests drive every transfer path with in-memory mocks.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use cloudshare_protocol::constants::MULTIPART_FILE_FIELD;
use cloudshare_protocol::{
    Capability, DownloadSpecification, ResponseEnvelope, UploadSpecification,
    UploadSpecificationRequest,
};

use crate::TransferError;

/// Boxed `Send` future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Streaming request or response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: ByteStream,
        length: Option<u64>,
    },
}

impl RequestBody {
    /// Declared body length, if known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(b) => Some(b.len() as u64),
            Self::Stream { length, .. } => *length,
        }
    }

    /// Turns any body into a stream.
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Empty => Box::pin(stream::empty()),
            Self::Bytes(b) => Box::pin(stream::once(async move { Ok(b) })),
            Self::Stream { stream, .. } => stream,
        }
    }

    /// Collects the whole body into memory.
    pub async fn collect(self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut s = self.into_stream();
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Stream { length, .. } => write!(f, "Stream(length: {length:?})"),
        }
    }
}

/// One HTTP call to be performed by an [`HttpExecutor`].
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Response handed back by an [`HttpExecutor`].
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Response with an in-memory body.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers: vec![("Content-Length".into(), body.len().to_string())],
            body: Box::pin(stream::once(async move { Ok(body) })),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Reads the whole body.
    pub async fn bytes(mut self) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Performs HTTP calls: authentication, redirects and transport live here.
pub trait HttpExecutor: Send + Sync {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransferError>>;
}

/// Server round-trips the transfer engine needs.
pub trait TransferApi: Send + Sync {
    /// Opens an upload session.
    fn upload_specification<'a>(
        &'a self,
        request: &'a UploadSpecificationRequest,
    ) -> BoxFuture<'a, Result<UploadSpecification, TransferError>>;

    /// Obtains a direct download URL for an item.
    fn download_specification<'a>(
        &'a self,
        item_uri: &'a str,
    ) -> BoxFuture<'a, Result<DownloadSpecification, TransferError>>;

    /// Lists capabilities of the provider hosting `uri`.
    fn capabilities<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Capability>, TransferError>>;
}

/// Appends percent-encoded query parameters to `url`.
pub fn append_query(url: &str, params: &[(&str, &str)]) -> String {
    let mut out = url.to_string();
    for (key, value) in params {
        let sep = if out.contains('?') { '&' } else { '?' };
        out.push(sep);
        out.push_str(key);
        out.push('=');
        out.push_str(&utf8_percent_encode(value, NON_ALPHANUMERIC).to_string());
    }
    out
}

/// Wraps `inner` in a single-field `multipart/form-data` envelope.
///
/// Returns the content type (with boundary) and the body.
pub fn multipart_body(
    file_name: &str,
    inner: ByteStream,
    inner_length: Option<u64>,
) -> (String, RequestBody) {
    let boundary = format!("upload-{}", uuid::Uuid::new_v4().simple());
    let name = file_name.replace('"', "");
    let prefix = Bytes::from(format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{MULTIPART_FILE_FIELD}\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    ));
    let suffix = Bytes::from(format!("\r\n--{boundary}--\r\n"));
    let length = inner_length.map(|l| prefix.len() as u64 + l + suffix.len() as u64);

    let body = stream::once(async move { Ok(prefix) })
        .chain(inner)
        .chain(stream::once(async move { Ok(suffix) }));

    (
        format!("multipart/form-data; boundary={boundary}"),
        RequestBody::Stream {
            stream: Box::pin(body),
            length,
        },
    )
}

/// Reads a response expected to carry a JSON envelope.
///
/// Returns the successful envelope with the raw body, or the typed error
/// the envelope (or status) describes. Error statuses whose body is still
/// an envelope keep the server's error code, so a rejected upload id is
/// recognised whatever status it arrives with.
pub async fn read_envelope(
    response: HttpResponse,
) -> Result<(ResponseEnvelope, Vec<u8>), TransferError> {
    let status = response.status;
    let success = response.is_success();
    let body = response.bytes().await?;

    match ResponseEnvelope::from_slice(&body) {
        Ok(env) if env.error => {
            let err = env.check().err().map(|e| TransferError::from_envelope(e, &body));
            Err(err.unwrap_or(TransferError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }))
        }
        Ok(env) if success => Ok((env, body)),
        Ok(_) => Err(TransferError::Status {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        }),
        Err(e) if success => Err(TransferError::from_envelope(e, &body)),
        Err(_) => Err(TransferError::Status {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        }),
    }
}
