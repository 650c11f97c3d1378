use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudshare_protocol::{Capability, UploadMethod, UploadSpecification};

use super::{ScalingPartUploader, UploadRequest, UploadSource, uploaded_items};
use crate::buffer::{BufferAllocator, BufferPool, HeapAllocator};
use crate::config::UploaderConfig;
use crate::error::FailureKind;
use crate::hash::IncrementalHasher;
use crate::http::{HttpExecutor, HttpRequest, TransferApi, append_query, read_envelope};
use crate::pause::PauseGate;
use crate::progress::ProgressReporter;
use crate::source::{FilePartSource, hash_prefix};
use crate::types::{ActiveUploadState, UploadResponse, UploadStatus};
use crate::{TransferError, UploadError, lock};

/// Threaded upload: specification, resume check, parts, finish.
///
/// If the server drops the session mid-transfer, the uploader throws away
/// its specification and starts over once. A second session loss is
/// returned to the caller.
pub struct ScalingUploader {
    api: Arc<dyn TransferApi>,
    executor: Arc<dyn HttpExecutor>,
    config: UploaderConfig,
    request: UploadRequest,
    capabilities: Option<Vec<Capability>>,
    specification: Option<UploadSpecification>,
    resume_state: Option<ActiveUploadState>,
    progress: ProgressReporter,
    pause: PauseGate,
    cancel: CancellationToken,
    status: UploadStatus,
    can_restart: bool,
}

impl ScalingUploader {
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
            capabilities: None,
            specification: None,
            resume_state: None,
            progress,
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
            status: UploadStatus::NotPrepared,
            can_restart: true,
        }
    }

    /// Skips the capability query with an already known set.
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Continues from a state returned by an earlier failed upload.
    pub fn with_state(mut self, state: ActiveUploadState) -> Self {
        self.resume_state = Some(state);
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

    /// Specification of the current session, once prepared.
    pub fn specification(&self) -> Option<&UploadSpecification> {
        self.specification.as_ref()
    }

    pub async fn upload<R: UploadSource>(
        &mut self,
        reader: &mut R,
    ) -> Result<UploadResponse, UploadError> {
        if let Err(e) = self.config.validate() {
            self.status = UploadStatus::Failed { resumable: false };
            return Err(e.into());
        }
        loop {
            match self.attempt(reader).await {
                Ok(response) => {
                    self.status = UploadStatus::Finished;
                    self.progress.mark_complete();
                    info!(
                        file_name = %self.request.file_name,
                        bytes = self.request.file_length,
                        "upload finished"
                    );
                    return Ok(response);
                }
                Err(e) if e.kind == FailureKind::SessionInvalid && self.can_restart => {
                    warn!(error = %e.source, "upload session lost, restarting from scratch");
                    self.can_restart = false;
                    self.specification = None;
                    self.resume_state = None;
                    self.status = UploadStatus::NotPrepared;
                    self.progress.reset();
                }
                Err(e) => {
                    self.status = UploadStatus::Failed {
                        resumable: e.state.is_some(),
                    };
                    self.progress.mark_complete();
                    return Err(e);
                }
            }
        }
    }

    async fn attempt<R: UploadSource>(
        &mut self,
        reader: &mut R,
    ) -> Result<UploadResponse, UploadError> {
        let specification = self.prepare().await?;
        let workers = self.worker_count(&specification).await?;
        let length = self.request.file_length;

        reader.seek(SeekFrom::Start(0)).await.map_err(TransferError::from)?;
        let mut hasher = IncrementalHasher::new();
        let (start_offset, start_index) =
            check_resume(&specification, length, reader, &mut hasher).await?;

        self.progress.reset();
        self.progress.report(start_offset as i64);
        self.status = UploadStatus::InProgress;

        let file_hash = Arc::new(Mutex::new(hasher));
        let next_index = if start_offset >= length && length > 0 {
            lock(&file_hash).finalize(&[]);
            start_index
        } else {
            let allocator: Arc<dyn BufferAllocator> = if self.config.pool_buffers {
                Arc::new(BufferPool::new(self.config.max_retained_buffers))
            } else {
                Arc::new(HeapAllocator)
            };
            let mut source = FilePartSource::new(
                &mut *reader,
                length,
                start_offset,
                start_index,
                allocator,
                Arc::clone(&file_hash),
            );
            let parts = ScalingPartUploader::new(
                Arc::clone(&self.executor),
                self.config.part.clone(),
                workers,
                self.config.raw,
                self.request.file_name.clone(),
                self.progress.clone(),
            )
            .with_cancellation(self.cancel.clone())
            .with_pause_gate(self.pause.clone());
            parts.upload(&mut source, &specification, start_index).await?
        };

        let hash = lock(&file_hash)
            .computed_hash()
            .map(str::to_owned)
            .unwrap_or_default();

        self.finish(&specification, &hash).await.map_err(|e| {
            UploadError::resumable(
                e,
                ActiveUploadState {
                    specification: specification.clone(),
                    bytes_uploaded: length,
                    next_part_index: next_index,
                },
            )
        })
    }

    /// Obtains (or reuses) the specification for this session.
    async fn prepare(&mut self) -> Result<UploadSpecification, TransferError> {
        if let Some(spec) = &self.specification {
            return Ok(spec.clone());
        }

        let spec = match &self.resume_state {
            Some(state) => {
                debug!(
                    bytes_uploaded = state.bytes_uploaded,
                    next_part_index = state.next_part_index,
                    "resuming from saved state"
                );
                state.resume_specification()
            }
            None => {
                let threads = self.thread_ceiling().await?;
                let request = self.request.specification_request(
                    UploadMethod::Threaded,
                    self.config.raw,
                    threads,
                );
                self.api.upload_specification(&request).await?
            }
        };
        self.specification = Some(spec.clone());
        self.status = UploadStatus::Prepared;
        Ok(spec)
    }

    /// Configured threads, or one if the provider cannot take parallel parts.
    async fn thread_ceiling(&mut self) -> Result<usize, TransferError> {
        let capabilities = match &self.capabilities {
            Some(c) => c.clone(),
            None => {
                let c = self.api.capabilities(&self.request.parent_uri).await?;
                self.capabilities = Some(c.clone());
                c
            }
        };
        if capabilities.contains(&Capability::ThreadedUploads) {
            Ok(self.config.number_of_threads)
        } else {
            Ok(1)
        }
    }

    async fn worker_count(&mut self, spec: &UploadSpecification) -> Result<usize, TransferError> {
        let threads = self
            .thread_ceiling()
            .await?
            .min(spec.max_number_of_threads.max(1));
        Ok(ScalingPartUploader::concurrency_limit(
            threads,
            self.request.file_length,
            self.config.part.min_file_size_for_multithreaded,
        ))
    }

    async fn finish(
        &self,
        spec: &UploadSpecification,
        file_hash: &str,
    ) -> Result<UploadResponse, TransferError> {
        if spec.finish_uri.is_empty() {
            return Err(TransferError::Malformed {
                reason: "upload specification has no finish uri".into(),
                body: String::new(),
            });
        }

        let mut params = vec![("respformat", "json"), ("filehash", file_hash)];
        if !self.request.details.is_empty() {
            params.push(("details", &self.request.details));
        }
        if !self.request.title.is_empty() {
            params.push(("title", &self.request.title));
        }
        let url = append_query(&spec.finish_uri, &params);

        let response = self.executor.execute(HttpRequest::get(url)).await?;
        let (envelope, body) = read_envelope(response).await?;
        let items = uploaded_items(envelope, &body)?;
        debug!(items = items.len(), %file_hash, "upload finish accepted");
        Ok(UploadResponse {
            items,
            file_hash: file_hash.to_string(),
        })
    }
}

/// Decides where the upload starts.
///
/// Hashes the prefix the server already holds into `hasher`. A server
/// resume hash that differs from ours means the prefix cannot be trusted:
/// the reader is rewound, `hasher` replaced and the upload starts at zero.
/// Without a server hash (a saved local state) the prefix is trusted.
async fn check_resume<R: UploadSource>(
    spec: &UploadSpecification,
    length: u64,
    reader: &mut R,
    hasher: &mut IncrementalHasher,
) -> Result<(u64, u64), TransferError> {
    if !spec.is_resume || spec.resume_offset == 0 {
        return Ok((0, 0));
    }
    if spec.resume_offset > length {
        warn!(
            resume_offset = spec.resume_offset,
            length, "resume offset beyond end of file, starting over"
        );
        return Ok((0, 0));
    }

    let prefix_hash = hash_prefix(reader, spec.resume_offset, hasher).await?;
    match &spec.resume_file_hash {
        Some(expected) if !expected.eq_ignore_ascii_case(&prefix_hash) => {
            info!(
                resume_offset = spec.resume_offset,
                "resume hash mismatch, starting over"
            );
            reader.seek(SeekFrom::Start(0)).await?;
            *hasher = IncrementalHasher::new();
            Ok((0, 0))
        }
        _ => {
            info!(
                resume_offset = spec.resume_offset,
                resume_index = spec.resume_index,
                "resuming upload"
            );
            Ok((spec.resume_offset, spec.resume_index))
        }
    }
}
