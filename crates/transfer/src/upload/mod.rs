//! Upload strategies.
//!
//! Small files (or providers without threaded uploads) go up in a single
//! request through [`StandardUploader`]. Everything else is split into
//! adaptively sized parts by [`ScalingUploader`]. [`FileUploader`] picks
//! between them.

mod part_uploader;
mod scaling;
mod standard;

pub use part_uploader::ScalingPartUploader;
pub use scaling::ScalingUploader;
pub use standard::StandardUploader;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cloudshare_protocol::{
    Capability, ResponseEnvelope, UploadMethod, UploadSpecificationRequest, UploadedItem,
};

use crate::config::UploaderConfig;
use crate::http::{ByteStream, HttpExecutor, HttpRequest, RequestBody, TransferApi, multipart_body};
use crate::pause::PauseGate;
use crate::progress::ProgressReporter;
use crate::types::{ActiveUploadState, UploadResponse, UploadStatus};
use crate::{TransferError, UploadError};

/// Slice size used when streaming an in-memory body, so progress moves
/// smoothly while a large part is on the wire.
const PROGRESS_SLICE: usize = 64 * 1024;

/// Anything an upload can read from and rewind.
pub trait UploadSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> UploadSource for T {}

/// What the caller wants uploaded, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Folder the file goes into.
    pub parent_uri: String,
    pub file_name: String,
    pub file_length: u64,
    pub title: String,
    pub details: String,
    pub overwrite: bool,
}

impl UploadRequest {
    pub fn new(
        parent_uri: impl Into<String>,
        file_name: impl Into<String>,
        file_length: u64,
    ) -> Self {
        Self {
            parent_uri: parent_uri.into(),
            file_name: file_name.into(),
            file_length,
            title: String::new(),
            details: String::new(),
            overwrite: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub(crate) fn specification_request(
        &self,
        method: UploadMethod,
        raw: bool,
        thread_count: usize,
    ) -> UploadSpecificationRequest {
        UploadSpecificationRequest {
            parent_uri: self.parent_uri.clone(),
            file_name: self.file_name.clone(),
            file_length: self.file_length,
            method,
            raw,
            overwrite: self.overwrite,
            title: self.title.clone(),
            details: self.details.clone(),
            thread_count,
        }
    }
}

/// Uploader chosen for a particular file.
pub enum FileUploader {
    Standard(StandardUploader),
    Scaling(ScalingUploader),
}

impl FileUploader {
    /// Picks a strategy from the file size and the provider's capabilities.
    ///
    /// Files below the standard-upload threshold never query capabilities.
    pub async fn select(
        api: Arc<dyn TransferApi>,
        executor: Arc<dyn HttpExecutor>,
        config: UploaderConfig,
        request: UploadRequest,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        if request.file_length < config.standard_upload_threshold {
            debug!(file_length = request.file_length, "using standard upload");
            return Ok(Self::Standard(StandardUploader::new(api, executor, config, request)));
        }

        let capabilities = api.capabilities(&request.parent_uri).await?;
        if capabilities.contains(&Capability::ThreadedUploads) {
            debug!(file_length = request.file_length, "using scaling upload");
            Ok(Self::Scaling(
                ScalingUploader::new(api, executor, config, request)
                    .with_capabilities(capabilities),
            ))
        } else {
            debug!(
                file_length = request.file_length,
                "provider lacks threaded uploads, using standard upload"
            );
            Ok(Self::Standard(StandardUploader::new(api, executor, config, request)))
        }
    }

    /// Continues an interrupted upload with the strategy it was started with.
    pub fn resume(
        api: Arc<dyn TransferApi>,
        executor: Arc<dyn HttpExecutor>,
        config: UploaderConfig,
        request: UploadRequest,
        state: ActiveUploadState,
    ) -> Self {
        match state.specification.method {
            UploadMethod::Standard => Self::Standard(
                StandardUploader::new(api, executor, config, request)
                    .with_specification(state.specification),
            ),
            UploadMethod::Threaded => Self::Scaling(
                ScalingUploader::new(api, executor, config, request).with_state(state),
            ),
        }
    }

    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        match self {
            Self::Standard(u) => Self::Standard(u.with_cancellation(cancel)),
            Self::Scaling(u) => Self::Scaling(u.with_cancellation(cancel)),
        }
    }

    pub fn with_pause_gate(self, pause: PauseGate) -> Self {
        match self {
            Self::Standard(u) => Self::Standard(u.with_pause_gate(pause)),
            Self::Scaling(u) => Self::Scaling(u.with_pause_gate(pause)),
        }
    }

    pub fn method(&self) -> UploadMethod {
        match self {
            Self::Standard(_) => UploadMethod::Standard,
            Self::Scaling(_) => UploadMethod::Threaded,
        }
    }

    pub fn progress(&self) -> &ProgressReporter {
        match self {
            Self::Standard(u) => u.progress(),
            Self::Scaling(u) => u.progress(),
        }
    }

    pub fn status(&self) -> UploadStatus {
        match self {
            Self::Standard(u) => u.status(),
            Self::Scaling(u) => u.status(),
        }
    }

    pub async fn upload<R: UploadSource>(
        &mut self,
        reader: &mut R,
    ) -> Result<UploadResponse, UploadError> {
        match self {
            Self::Standard(u) => u.upload(reader).await,
            Self::Scaling(u) => u.upload(reader).await,
        }
    }
}

/// Builds a POST carrying `body`, raw or wrapped in a multipart form.
pub(crate) fn upload_request(
    url: String,
    raw: bool,
    file_name: &str,
    body: ByteStream,
    length: u64,
) -> HttpRequest {
    if raw {
        HttpRequest::post(
            url,
            RequestBody::Stream {
                stream: body,
                length: Some(length),
            },
        )
        .with_header("Content-Type", "application/octet-stream")
    } else {
        let (content_type, body) = multipart_body(file_name, body, Some(length));
        HttpRequest::post(url, body).with_header("Content-Type", content_type)
    }
}

/// Streams `data` in slices.
pub(crate) fn sliced(data: Bytes) -> ByteStream {
    let slices: Vec<_> = (0..data.len())
        .step_by(PROGRESS_SLICE)
        .map(|start| Ok(data.slice(start..(start + PROGRESS_SLICE).min(data.len()))))
        .collect();
    Box::pin(stream::iter(slices))
}

/// Reports every chunk pulled from `inner` and tallies it in `sent`, so a
/// failed attempt can roll its bytes back.
pub(crate) fn reporting(
    inner: ByteStream,
    progress: ProgressReporter,
    sent: Arc<AtomicU64>,
) -> ByteStream {
    Box::pin(inner.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            progress.report(chunk.len() as i64);
        }
    }))
}

/// Decodes the item list a completed upload returns.
///
/// Servers answer with either a list or a single item.
pub(crate) fn uploaded_items(
    envelope: ResponseEnvelope,
    body: &[u8],
) -> Result<Vec<UploadedItem>, TransferError> {
    let value: serde_json::Value = envelope
        .into_value()
        .map_err(|e| TransferError::from_envelope(e, body))?;
    let items = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|item| vec![item])
    };
    items.map_err(|e| TransferError::Malformed {
        reason: e.to_string(),
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators shared by the upload tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use cloudshare_protocol::{DownloadSpecification, UploadSpecification};

    use super::*;
    use crate::http::{BoxFuture, HttpResponse, Method};

    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * KIB;

    /// A request as the mock server saw it.
    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub method: Method,
        pub url: String,
        pub range: Option<String>,
        pub body: Vec<u8>,
    }

    impl Recorded {
        pub fn query(&self, key: &str) -> Option<String> {
            let query = self.url.split_once('?')?.1;
            query.split('&').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == key).then(|| v.to_string())
            })
        }

        pub fn is_chunk(&self) -> bool {
            self.method == Method::Post && self.query("index").is_some()
        }

        pub fn is_finish(&self) -> bool {
            self.method == Method::Get && self.query("filehash").is_some()
        }
    }

    type Responder = Box<dyn Fn(&Recorded) -> HttpResponse + Send + Sync>;

    /// Executor that records requests and answers through a responder.
    pub struct MockExecutor {
        pub requests: Mutex<Vec<Recorded>>,
        responder: Responder,
    }

    impl MockExecutor {
        pub fn new(responder: impl Fn(&Recorded) -> HttpResponse + Send + Sync + 'static) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        /// Accepts every part and answers the finish call with one item.
        pub fn accepting() -> Self {
            Self::new(default_response)
        }

        pub fn recorded(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }

        pub fn chunks(&self) -> Vec<Recorded> {
            self.recorded().into_iter().filter(Recorded::is_chunk).collect()
        }
    }

    pub fn ok_envelope() -> HttpResponse {
        HttpResponse::from_bytes(200, r#"{"Error":false,"Value":true}"#)
    }

    pub fn item_envelope(hash: &str) -> HttpResponse {
        HttpResponse::from_bytes(
            200,
            format!(
                r#"{{"Error":false,"Value":[{{"FileName":"data.bin","Id":"fi-1","Size":0,"Hash":"{hash}"}}]}}"#
            ),
        )
    }

    pub fn default_response(req: &Recorded) -> HttpResponse {
        if req.is_finish() {
            item_envelope(&req.query("filehash").unwrap_or_default())
        } else if req.method == Method::Post && !req.is_chunk() {
            item_envelope(&crate::hash::md5_hex(&req.body))
        } else {
            ok_envelope()
        }
    }

    impl HttpExecutor for MockExecutor {
        fn execute(
            &self,
            request: HttpRequest,
        ) -> BoxFuture<'_, Result<HttpResponse, TransferError>> {
            Box::pin(async move {
                let range = request.header("Range").map(str::to_owned);
                let body = request.body.collect().await?;
                let recorded = Recorded {
                    method: request.method,
                    url: request.url,
                    range,
                    body,
                };
                let response = (self.responder)(&recorded);
                self.requests.lock().unwrap().push(recorded);
                Ok(response)
            })
        }
    }

    /// Holds every request for `delay` and tracks how many overlap.
    pub struct InFlightExecutor {
        pub inner: MockExecutor,
        delay: std::time::Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlightExecutor {
        pub fn new(inner: MockExecutor, delay: std::time::Duration) -> Self {
            Self {
                inner,
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        /// Most requests that were ever in flight at once.
        pub fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl HttpExecutor for InFlightExecutor {
        fn execute(
            &self,
            request: HttpRequest,
        ) -> BoxFuture<'_, Result<HttpResponse, TransferError>> {
            Box::pin(async move {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                let response = self.inner.execute(request).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                response
            })
        }
    }

    /// API mock handing out specifications from a queue.
    pub struct MockApi {
        pub capabilities: Vec<Capability>,
        pub specifications: Mutex<VecDeque<UploadSpecification>>,
        pub spec_requests: Mutex<Vec<UploadSpecificationRequest>>,
        pub capability_calls: Mutex<u32>,
        pub download: Option<DownloadSpecification>,
    }

    impl MockApi {
        pub fn new(capabilities: Vec<Capability>) -> Self {
            Self {
                capabilities,
                specifications: Mutex::new(VecDeque::new()),
                spec_requests: Mutex::new(Vec::new()),
                capability_calls: Mutex::new(0),
                download: None,
            }
        }

        pub fn threaded() -> Self {
            Self::new(vec![Capability::ThreadedUploads])
        }

        pub fn with_specs(self, specs: impl IntoIterator<Item = UploadSpecification>) -> Self {
            self.specifications.lock().unwrap().extend(specs);
            self
        }

        pub fn spec_count(&self) -> usize {
            self.spec_requests.lock().unwrap().len()
        }
    }

    pub fn threaded_spec(session: &str, max_threads: usize) -> UploadSpecification {
        UploadSpecification {
            method: UploadMethod::Threaded,
            prepare_uri: String::new(),
            chunk_uri: format!("https://up.example.com/upload-threaded?uploadid={session}"),
            finish_uri: format!("https://up.example.com/upload-threaded?uploadid={session}&finish=true"),
            is_resume: false,
            resume_index: 0,
            resume_offset: 0,
            resume_file_hash: None,
            max_number_of_threads: max_threads,
        }
    }

    pub fn standard_spec() -> UploadSpecification {
        UploadSpecification {
            method: UploadMethod::Standard,
            prepare_uri: String::new(),
            chunk_uri: "https://up.example.com/upload?uploadid=std".into(),
            finish_uri: String::new(),
            is_resume: false,
            resume_index: 0,
            resume_offset: 0,
            resume_file_hash: None,
            max_number_of_threads: 1,
        }
    }

    impl TransferApi for MockApi {
        fn upload_specification<'a>(
            &'a self,
            request: &'a UploadSpecificationRequest,
        ) -> BoxFuture<'a, Result<UploadSpecification, TransferError>> {
            Box::pin(async move {
                self.spec_requests.lock().unwrap().push(request.clone());
                let next = self.specifications.lock().unwrap().pop_front();
                Ok(next.unwrap_or_else(|| match request.method {
                    UploadMethod::Standard => standard_spec(),
                    UploadMethod::Threaded => threaded_spec("default", 4),
                }))
            })
        }

        fn download_specification<'a>(
            &'a self,
            item_uri: &'a str,
        ) -> BoxFuture<'a, Result<DownloadSpecification, TransferError>> {
            Box::pin(async move {
                let direct = || DownloadSpecification::direct(format!("{item_uri}/Download"));
                Ok(self.download.clone().unwrap_or_else(direct))
            })
        }

        fn capabilities<'a>(
            &'a self,
            _uri: &'a str,
        ) -> BoxFuture<'a, Result<Vec<Capability>, TransferError>> {
            Box::pin(async move {
                *self.capability_calls.lock().unwrap() += 1;
                Ok(self.capabilities.clone())
            })
        }
    }

    pub fn file_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }
}
