use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudshare_protocol::{UploadMethod, UploadSpecification};

use super::{UploadRequest, UploadSource, reporting, upload_request, uploaded_items};
use crate::config::UploaderConfig;
use crate::error::FailureKind;
use crate::hash::IncrementalHasher;
use crate::http::{ByteStream, HttpExecutor, TransferApi, append_query, read_envelope};
use crate::pause::PauseGate;
use crate::progress::ProgressReporter;
use crate::types::{UploadResponse, UploadStatus};
use crate::{TransferError, UploadError, lock};

/// Read size while streaming the file into the request body.
const STREAM_CHUNK: usize = 64 * 1024;

/// Uploads a file in a single request.
///
/// There is no partial resume: a failed attempt rewinds the source and
/// sends the whole file again, up to the configured attempt count.
pub struct StandardUploader {
    api: Arc<dyn TransferApi>,
    executor: Arc<dyn HttpExecutor>,
    config: UploaderConfig,
    request: UploadRequest,
    specification: Option<UploadSpecification>,
    progress: ProgressReporter,
    pause: PauseGate,
    cancel: CancellationToken,
    status: UploadStatus,
}

impl StandardUploader {
    pub fn new(
        api: Arc<dyn TransferApi>,
        executor: Arc<dyn HttpExecutor>,
        config: UploaderConfig,
        request: UploadRequest,
    ) -> Self {
        let progress = ProgressReporter::new(request.file_length, config.progress_interval);
        progress.set_metadata("fileName", request.file_name.clone());
        Self {
            api,
            executor,
            config,
            request,
            specification: None,
            progress,
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
            status: UploadStatus::NotPrepared,
        }
    }

    /// Uses an already issued specification instead of requesting one.
    pub fn with_specification(mut self, specification: UploadSpecification) -> Self {
        self.specification = Some(specification);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pause_gate(mut self, pause: PauseGate) -> Self {
        self.pause = pause;
        self
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub async fn upload<R: UploadSource>(
        &mut self,
        reader: &mut R,
    ) -> Result<UploadResponse, UploadError> {
        match self.run(reader).await {
            Ok(response) => {
                self.status = UploadStatus::Finished;
                self.progress.mark_complete();
                info!(
                    file_name = %self.request.file_name,
                    bytes = self.request.file_length,
                    "standard upload finished"
                );
                Ok(response)
            }
            Err(e) => {
                self.status = UploadStatus::Failed { resumable: false };
                self.progress.mark_complete();
                Err(UploadError::new(e))
            }
        }
    }

    async fn run<R: UploadSource>(
        &mut self,
        reader: &mut R,
    ) -> Result<UploadResponse, TransferError> {
        self.config.validate()?;
        let specification = match &self.specification {
            Some(spec) => spec.clone(),
            None => {
                let request = self.request.specification_request(
                    UploadMethod::Standard,
                    self.config.raw,
                    1,
                );
                let spec = self.api.upload_specification(&request).await?;
                self.specification = Some(spec.clone());
                spec
            }
        };
        self.status = UploadStatus::Prepared;

        let attempts = self.config.standard_upload_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.pause.wait(&self.cancel).await?;
            reader.seek(SeekFrom::Start(0)).await?;
            if attempt > 1 {
                self.progress.reset();
            }
            self.status = UploadStatus::InProgress;

            match self.attempt(&specification, reader).await {
                Ok(response) => return Ok(response),
                Err(_) if self.cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(e) if attempt < attempts && e.kind() == FailureKind::Transient => {
                    warn!(attempt, error = %e, "standard upload failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<R: UploadSource>(
        &self,
        specification: &UploadSpecification,
        reader: &mut R,
    ) -> Result<UploadResponse, TransferError> {
        let url = append_query(&specification.chunk_uri, &[("fmt", "json")]);
        let hasher = Arc::new(Mutex::new(IncrementalHasher::new()));
        let sent = Arc::new(AtomicU64::new(0));

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let body: ByteStream = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }));
        let body = reporting(body, self.progress.clone(), Arc::clone(&sent));
        let request = upload_request(
            url,
            self.config.raw,
            &self.request.file_name,
            body,
            self.request.file_length,
        );

        let produce = feed(reader, self.request.file_length, tx, Arc::clone(&hasher));
        let send = async {
            let response = self.executor.execute(request).await?;
            read_envelope(response).await
        };
        let (fed, sent_result) = tokio::join!(produce, send);

        let outcome = fed.and(sent_result);
        let (envelope, body) = match outcome {
            Ok(v) => v,
            Err(e) => {
                self.progress.report(-(sent.load(Ordering::Relaxed) as i64));
                return Err(e);
            }
        };

        let file_hash = lock(&hasher)
            .computed_hash()
            .map(str::to_owned)
            .unwrap_or_default();
        let items = uploaded_items(envelope, &body)?;
        debug!(items = items.len(), %file_hash, "standard upload accepted");
        Ok(UploadResponse { items, file_hash })
    }
}

/// Pumps `length` bytes from `reader` into `tx`, hashing them on the way.
///
/// Stops quietly if the request stops pulling the body.
async fn feed<R: UploadSource>(
    reader: &mut R,
    length: u64,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    hasher: Arc<Mutex<IncrementalHasher>>,
) -> Result<(), TransferError> {
    let mut left = length;
    loop {
        let n = left.min(STREAM_CHUNK as u64) as usize;
        let mut buf = vec![0u8; n];
        if let Err(e) = reader.read_exact(&mut buf).await {
            let kind = e.kind();
            let _ = tx.send(Err(std::io::Error::new(kind, e.to_string()))).await;
            return Err(e.into());
        }
        left -= n as u64;
        {
            let mut hasher = lock(&hasher);
            if left == 0 {
                hasher.finalize(&buf);
            } else {
                hasher.append(&buf);
            }
        }
        if n > 0 && tx.send(Ok(Bytes::from(buf))).await.is_err() {
            return Ok(());
        }
        if left == 0 {
            return Ok(());
        }
    }
}
