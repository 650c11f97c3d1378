use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cloudshare_protocol::UploadSpecification;

use super::{reporting, sliced, upload_request};
use crate::config::FilePartConfig;
use crate::error::FailureKind;
use crate::http::{HttpExecutor, append_query, read_envelope};
use crate::part_size::PartSizeCalculator;
use crate::pause::PauseGate;
use crate::progress::ProgressReporter;
use crate::ranges::CompletedRangeTracker;
use crate::source::FilePartSource;
use crate::types::{ActiveUploadState, FilePart};
use crate::{TransferError, UploadError, lock};

/// Uploads the parts of one file over a bounded pool of concurrent workers.
///
/// The dispatch loop claims parts from the source one at a time, at the
/// current adaptive size, and spawns a worker per part once a permit is
/// free. Workers retry transient failures, feed their timing back into
/// the part size, and record the acknowledged range. The first terminal
/// failure stops new claims; the upload then fails with the resume point
/// at the end of the gap-free acknowledged prefix.
pub struct ScalingPartUploader {
    executor: Arc<dyn HttpExecutor>,
    config: FilePartConfig,
    concurrent_workers: usize,
    raw: bool,
    file_name: String,
    progress: ProgressReporter,
    pause: PauseGate,
    cancel: CancellationToken,
}

/// State shared between the dispatch loop and its workers.
struct Shared {
    executor: Arc<dyn HttpExecutor>,
    specification: UploadSpecification,
    raw: bool,
    file_name: String,
    attempts: u32,
    calculator: PartSizeCalculator,
    part_size: Mutex<u64>,
    tracker: Mutex<CompletedRangeTracker>,
    give_up: AtomicBool,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl ScalingPartUploader {
    pub fn new(
        executor: Arc<dyn HttpExecutor>,
        config: FilePartConfig,
        concurrent_workers: usize,
        raw: bool,
        file_name: impl Into<String>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            executor,
            config,
            concurrent_workers: concurrent_workers.max(1),
            raw,
            file_name: file_name.into(),
            progress,
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pause_gate(mut self, pause: PauseGate) -> Self {
        self.pause = pause;
        self
    }

    /// Worker count for a file: small files get a single worker.
    pub fn concurrency_limit(
        threads: usize,
        file_length: u64,
        min_multithreaded_size: u64,
    ) -> usize {
        let cap = file_length / min_multithreaded_size.max(1) + 1;
        threads
            .max(1)
            .min(usize::try_from(cap).unwrap_or(usize::MAX))
    }

    pub fn concurrent_workers(&self) -> usize {
        self.concurrent_workers
    }

    /// Uploads every remaining part of `source`.
    ///
    /// `start_index` is the index of the part at the source's current
    /// position. Returns the index following the last uploaded part.
    pub async fn upload<R: AsyncRead + Unpin + Send>(
        &self,
        source: &mut FilePartSource<R>,
        specification: &UploadSpecification,
        start_index: u64,
    ) -> Result<u64, UploadError> {
        let shared = Arc::new(Shared {
            executor: Arc::clone(&self.executor),
            specification: specification.clone(),
            raw: self.raw,
            file_name: self.file_name.clone(),
            attempts: self.config.part_retry_count + 1,
            calculator: PartSizeCalculator::new(&self.config, self.concurrent_workers),
            part_size: Mutex::new(self.config.initial_part_size),
            tracker: Mutex::new(CompletedRangeTracker::with_completed_prefix(source.position())),
            give_up: AtomicBool::new(false),
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrent_workers));
        let mut workers = JoinSet::new();
        let mut failure: Option<TransferError> = None;

        debug!(
            workers = self.concurrent_workers,
            offset = source.position(),
            length = source.length(),
            "dispatching parts"
        );

        while source.has_more() && !shared.give_up.load(Ordering::Acquire) {
            if let Err(e) = self.pause.wait(&self.cancel).await {
                failure = Some(e);
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
                _ = self.cancel.cancelled() => {
                    failure = Some(TransferError::Cancelled);
                    break;
                }
            };
            let Ok(permit) = permit else { break };

            // A worker may have given up while we waited for the permit.
            if shared.give_up.load(Ordering::Acquire) {
                break;
            }

            let size = *lock(&shared.part_size);
            let part = match source.next_part(size).await {
                Ok(part) => part,
                Err(e) => {
                    warn!(error = %e, "failed to read next part");
                    failure = Some(e);
                    break;
                }
            };

            let shared = Arc::clone(&shared);
            workers.spawn(async move {
                let result = shared.upload_part(&part).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(TransferError::Io(std::io::Error::other(e.to_string()))));
            if let Err(e) = result
                && failure.is_none()
            {
                failure = Some(e);
            }
        }

        let tracker = lock(&shared.tracker);
        let next_index = start_index + tracker.completed_prefix_parts();
        let Some(error) = failure else {
            return Ok(next_index);
        };

        let error = if self.cancel.is_cancelled() {
            TransferError::Cancelled
        } else {
            error
        };
        let state = ActiveUploadState {
            specification: specification.clone(),
            bytes_uploaded: tracker.completed_through_position(),
            next_part_index: next_index,
        };
        debug!(
            bytes_uploaded = state.bytes_uploaded,
            next_part_index = state.next_part_index,
            kind = %error.kind(),
            "part upload stopped"
        );
        Err(UploadError::resumable(error, state))
    }
}

impl Shared {
    async fn upload_part(&self, part: &FilePart) -> Result<(), TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                self.give_up.store(true, Ordering::Release);
                return Err(TransferError::Cancelled);
            }

            let started = Instant::now();
            match self.send_part(part).await {
                Ok(()) => {
                    self.complete(part, started);
                    return Ok(());
                }
                Err(e)
                    if attempt < self.attempts
                        && matches!(e.kind(), FailureKind::Transient | FailureKind::Malformed) =>
                {
                    warn!(
                        index = part.index,
                        offset = part.offset,
                        attempt,
                        error = %e,
                        "part upload failed, retrying"
                    );
                }
                Err(e) => {
                    warn!(
                        index = part.index,
                        offset = part.offset,
                        attempt,
                        error = %e,
                        "part upload failed"
                    );
                    self.give_up.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    async fn send_part(&self, part: &FilePart) -> Result<(), TransferError> {
        let url = append_query(
            &self.specification.chunk_uri,
            &[
                ("index", &part.index.to_string()),
                ("byteOffset", &part.offset.to_string()),
                ("hash", &part.hash),
            ],
        );
        let sent = Arc::new(AtomicU64::new(0));
        let body = reporting(sliced(part.data.clone()), self.progress.clone(), Arc::clone(&sent));
        let request = upload_request(url, self.raw, &self.file_name, body, part.length);

        let result = async {
            let response = self.executor.execute(request).await?;
            read_envelope(response).await.map(|_| ())
        }
        .await;

        let streamed = sent.load(Ordering::Relaxed);
        match &result {
            Ok(()) => self.progress.report(part.length as i64 - streamed as i64),
            Err(_) => self.progress.report(-(streamed as i64)),
        }
        result
    }

    fn complete(&self, part: &FilePart, started: Instant) {
        let elapsed = started.elapsed();
        lock(&self.tracker).add(part.offset, part.length);

        let mut size = lock(&self.part_size);
        let next = self.calculator.next_part_size(*size, part.length, elapsed);
        if next != *size {
            debug!(from = *size, to = next, "part size adjusted");
        }
        *size = next;
        drop(size);

        debug!(
            index = part.index,
            offset = part.offset,
            length = part.length,
            elapsed_ms = elapsed.as_millis() as u64,
            "part uploaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;
    use crate::buffer::HeapAllocator;
    use crate::hash::{IncrementalHasher, md5_hex};
    use crate::http::HttpResponse;
    use cloudshare_protocol::constants::ERROR_CODE_INVALID_UPLOAD_ID;

    fn part_config(part_size: u64, retries: u32) -> FilePartConfig {
        FilePartConfig {
            initial_part_size: part_size,
            min_part_size: part_size,
            max_part_size: part_size,
            part_retry_count: retries,
            ..FilePartConfig::default()
        }
    }

    fn source(data: &[u8]) -> FilePartSource<Cursor<Vec<u8>>> {
        FilePartSource::new(
            Cursor::new(data.to_vec()),
            data.len() as u64,
            0,
            0,
            Arc::new(HeapAllocator),
            Arc::new(Mutex::new(IncrementalHasher::new())),
        )
    }

    fn uploader(
        executor: Arc<dyn HttpExecutor>,
        config: FilePartConfig,
        workers: usize,
    ) -> ScalingPartUploader {
        ScalingPartUploader::new(
            executor,
            config,
            workers,
            true,
            "data.bin",
            ProgressReporter::new(0, Duration::ZERO),
        )
    }

    fn server_error() -> HttpResponse {
        HttpResponse::from_bytes(500, "boom")
    }

    fn invalid_upload_id() -> HttpResponse {
        HttpResponse::from_bytes(
            200,
            format!(
                r#"{{"Error":true,"ErrorCode":{ERROR_CODE_INVALID_UPLOAD_ID},"ErrorMessage":"Invalid uploadId"}}"#
            ),
        )
    }

    #[test]
    fn concurrency_limit_by_size() {
        assert_eq!(ScalingPartUploader::concurrency_limit(8, KIB, 8 * MIB), 1);
        assert_eq!(ScalingPartUploader::concurrency_limit(8, 8 * MIB, 8 * MIB), 2);
        assert_eq!(ScalingPartUploader::concurrency_limit(4, 100 * MIB, 8 * MIB), 4);
        assert_eq!(ScalingPartUploader::concurrency_limit(0, 100 * MIB, 8 * MIB), 1);
    }

    #[tokio::test]
    async fn uploads_all_parts_with_wire_parameters() {
        let data = file_data(10_000);
        let executor = Arc::new(MockExecutor::accepting());
        let up = uploader(executor.clone(), part_config(4096, 1), 3);
        let mut src = source(&data);

        let next = up.upload(&mut src, &threaded_spec("s", 4), 0).await.unwrap();
        assert_eq!(next, 3);

        let mut chunks = executor.chunks();
        chunks.sort_by_key(|c| c.query("index").unwrap().parse::<u64>().unwrap());
        assert_eq!(chunks.len(), 3);
        let mut joined = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.query("index").unwrap(), i.to_string());
            assert_eq!(c.query("byteOffset").unwrap(), (i * 4096).to_string());
            assert_eq!(c.query("hash").unwrap(), md5_hex(&c.body));
            assert!(c.url.starts_with("https://up.example.com/upload-threaded?uploadid=s&index="));
            joined.extend_from_slice(&c.body);
        }
        assert_eq!(joined, data);
        assert_eq!(up.progress.bytes_transferred(), 10_000);
    }

    #[tokio::test]
    async fn part_succeeding_within_retry_ceiling_is_recorded_once() {
        let data = file_data(1000);
        let calls = AtomicUsize::new(0);
        let executor = Arc::new(MockExecutor::new(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                server_error()
            } else {
                ok_envelope()
            }
        }));
        let up = uploader(executor.clone(), part_config(4096, 2), 1);
        let mut src = source(&data);

        up.upload(&mut src, &threaded_spec("s", 1), 0).await.unwrap();
        assert_eq!(executor.chunks().len(), 3);
        // Failed attempts roll their streamed bytes back.
        assert_eq!(up.progress.bytes_transferred(), 1000);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_one_resumable_error() {
        let data = file_data(3 * 4096);
        // First part succeeds, every later request fails.
        let executor = Arc::new(MockExecutor::new(|req| {
            if req.query("index").as_deref() == Some("0") {
                ok_envelope()
            } else {
                server_error()
            }
        }));
        let up = uploader(executor.clone(), part_config(4096, 1), 1);
        let mut src = source(&data);

        let err = up.upload(&mut src, &threaded_spec("s", 1), 0).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(matches!(err.source, TransferError::Status { status: 500, .. }));
        let state = err.state.unwrap();
        assert_eq!(state.bytes_uploaded, 4096);
        assert_eq!(state.next_part_index, 1);
        // Part 1 tried twice, part 2 never claimed.
        assert_eq!(executor.chunks().len(), 3);
        assert_eq!(up.progress.bytes_transferred(), 4096);
    }

    #[tokio::test]
    async fn invalid_upload_id_is_not_retried() {
        let data = file_data(1000);
        let executor = Arc::new(MockExecutor::new(|_| invalid_upload_id()));
        let up = uploader(executor.clone(), part_config(4096, 5), 1);
        let mut src = source(&data);

        let err = up.upload(&mut src, &threaded_spec("s", 1), 0).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::SessionInvalid);
        assert_eq!(executor.chunks().len(), 1);
    }

    #[tokio::test]
    async fn gap_keeps_resume_point_at_prefix() {
        let data = file_data(4 * 1024);
        // Part 1 fails; parts 0, 2 and 3 may succeed out of order.
        let executor = Arc::new(MockExecutor::new(|req| {
            if req.query("index").as_deref() == Some("1") {
                server_error()
            } else {
                ok_envelope()
            }
        }));
        let up = uploader(executor.clone(), part_config(1024, 0), 4);
        let mut src = source(&data);

        let err = up.upload(&mut src, &threaded_spec("s", 4), 0).await.unwrap_err();
        let state = err.state.unwrap();
        assert_eq!(state.bytes_uploaded, 1024);
        assert_eq!(state.next_part_index, 1);
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_cancelled() {
        let data = file_data(1000);
        let executor = Arc::new(MockExecutor::accepting());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let up = uploader(executor.clone(), part_config(256, 1), 2).with_cancellation(cancel);
        let mut src = source(&data);

        let err = up.upload(&mut src, &threaded_spec("s", 2), 0).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.state.unwrap().bytes_uploaded, 0);
        assert!(executor.chunks().is_empty());
    }

    #[tokio::test]
    async fn in_flight_parts_never_exceed_worker_count() {
        let data = file_data(8 * 1024);
        let executor = Arc::new(InFlightExecutor::new(
            MockExecutor::accepting(),
            Duration::from_millis(20),
        ));
        let up = uploader(executor.clone(), part_config(1024, 0), 3);
        let mut src = source(&data);

        let next = up.upload(&mut src, &threaded_spec("s", 3), 0).await.unwrap();
        assert_eq!(next, 8);
        assert_eq!(executor.inner.chunks().len(), 8);
        assert_eq!(executor.peak(), 3);
    }

    #[tokio::test]
    async fn cancel_during_transfer_keeps_resume_point() {
        let data = file_data(4 * 1024);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        // Part 2 is in flight when the caller cancels, and its request fails.
        let executor = Arc::new(MockExecutor::new(move |req| {
            if req.query("index").as_deref() == Some("2") {
                trigger.cancel();
                server_error()
            } else {
                ok_envelope()
            }
        }));
        let up = uploader(executor.clone(), part_config(1024, 3), 1).with_cancellation(cancel);
        let mut src = source(&data);

        let err = up.upload(&mut src, &threaded_spec("s", 1), 0).await.unwrap_err();
        assert!(err.is_cancelled());
        let state = err.state.unwrap();
        assert_eq!(state.bytes_uploaded, 2048);
        assert_eq!(state.next_part_index, 2);
        // No retry after the cancel, and part 3 is never claimed.
        assert_eq!(executor.chunks().len(), 3);
        assert_eq!(up.progress.bytes_transferred(), 2048);
    }

    #[tokio::test]
    async fn resumed_source_continues_numbering() {
        let data = file_data(3000);
        let mut cursor = Cursor::new(data.clone());
        cursor.set_position(1000);
        let mut src = FilePartSource::new(
            cursor,
            3000,
            1000,
            4,
            Arc::new(HeapAllocator),
            Arc::new(Mutex::new(IncrementalHasher::new())),
        );
        let executor = Arc::new(MockExecutor::accepting());
        let up = uploader(executor.clone(), part_config(1000, 0), 1);

        let next = up.upload(&mut src, &threaded_spec("s", 1), 4).await.unwrap();
        assert_eq!(next, 6);
        let indices: Vec<_> = executor.chunks().iter().map(|c| c.query("index").unwrap()).collect();
        assert_eq!(indices, vec!["4", "5"]);
    }

    #[tokio::test]
    async fn multipart_bodies_when_not_raw() {
        let data = file_data(100);
        let executor = Arc::new(MockExecutor::accepting());
        let up = ScalingPartUploader::new(
            executor.clone(),
            part_config(4096, 0),
            1,
            false,
            "data.bin",
            ProgressReporter::new(0, Duration::ZERO),
        );
        let mut src = source(&data);
        up.upload(&mut src, &threaded_spec("s", 1), 0).await.unwrap();

        let chunk = &executor.chunks()[0];
        let body = String::from_utf8_lossy(&chunk.body);
        assert!(body.contains("name=\"File1\"; filename=\"data.bin\""));
        // Hash is over the part, not the form.
        assert_eq!(chunk.query("hash").unwrap(), md5_hex(&data));
    }
}
