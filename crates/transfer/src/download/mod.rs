//! Streamed downloads.

mod mapped;

pub use mapped::{MappedFileDownloader, MappedReader};

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudshare_protocol::{Capability, DownloadSpecification};

use crate::TransferError;
use crate::config::DownloaderConfig;
use crate::http::{HttpExecutor, HttpRequest, TransferApi};
use crate::pause::PauseGate;
use crate::progress::ProgressReporter;
use crate::types::RangeRequest;

/// The item to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    /// API address of the item.
    pub uri: String,
    /// Size in bytes, when the caller knows it.
    pub size: Option<u64>,
}

impl DownloadItem {
    pub fn new(uri: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            uri: uri.into(),
            size,
        }
    }

    /// Action URL streaming the item's content.
    pub fn direct_url(&self) -> String {
        format!("{}/Download", self.uri.trim_end_matches('/'))
    }
}

/// Downloads one item into any async writer.
pub struct FileDownloader {
    api: Arc<dyn TransferApi>,
    executor: Arc<dyn HttpExecutor>,
    config: DownloaderConfig,
    item: DownloadItem,
    specification: Option<DownloadSpecification>,
    progress: ProgressReporter,
    pause: PauseGate,
    cancel: CancellationToken,
}

impl FileDownloader {
    pub fn new(
        api: Arc<dyn TransferApi>,
        executor: Arc<dyn HttpExecutor>,
        config: DownloaderConfig,
        item: DownloadItem,
    ) -> Self {
        let progress = ProgressReporter::new(item.size.unwrap_or(0), config.progress_interval);
        progress.set_metadata("itemUri", item.uri.clone());
        Self {
            api,
            executor,
            config,
            item,
            specification: None,
            progress,
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses a caller-supplied specification instead of asking the server.
    pub fn with_specification(mut self, specification: DownloadSpecification) -> Self {
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

    pub fn item(&self) -> &DownloadItem {
        &self.item
    }

    /// Resolves where to download from.
    ///
    /// Providers that advertise download specifications are asked for one;
    /// otherwise the item's own download action is used.
    pub async fn prepare(&mut self) -> Result<DownloadSpecification, TransferError> {
        if let Some(spec) = &self.specification {
            return Ok(spec.clone());
        }
        let capabilities = self.api.capabilities(&self.item.uri).await?;
        let spec = if capabilities.contains(&Capability::DownloadSpecification) {
            self.api.download_specification(&self.item.uri).await?
        } else {
            DownloadSpecification::direct(self.item.direct_url())
        };
        debug!(
            url = %spec.download_url,
            ranges = spec.supports_range_requests,
            "download prepared"
        );
        self.specification = Some(spec.clone());
        Ok(spec)
    }

    /// Streams the item (or `range` of it) into `writer`.
    ///
    /// Returns the number of bytes written. The length read is checked
    /// against the range span or the known item size.
    pub async fn download_to<W: AsyncWrite + Unpin + Send>(
        &mut self,
        writer: &mut W,
        range: Option<RangeRequest>,
    ) -> Result<u64, TransferError> {
        self.config.validate()?;
        let result = self.fetch(writer, range, 0).await;
        self.progress.mark_complete();
        result
    }

    /// Downloads into the file at `path`.
    ///
    /// With `resume` set and a partial file present, only the missing tail
    /// is requested and appended. Returns the final file length.
    pub async fn download_to_file(
        &mut self,
        path: &Path,
        resume: bool,
    ) -> Result<u64, TransferError> {
        self.config.validate()?;
        let spec = self.prepare().await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::metadata(path).await {
            Ok(meta) if resume => meta.len(),
            _ => 0,
        };

        if existing > 0 && Some(existing) == self.item.size {
            info!(path = %path.display(), "file already complete");
            self.progress.set_total_bytes(existing);
            self.progress.report(existing as i64);
            self.progress.mark_complete();
            return Ok(existing);
        }

        let result = if existing > 0 && spec.supports_range_requests {
            info!(path = %path.display(), offset = existing, "resuming download");
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await?;
            file.seek(SeekFrom::Start(existing)).await?;
            self.progress.report(existing as i64);
            self.fetch(&mut file, Some(RangeRequest::from_offset(existing)), existing)
                .await
                .map(|n| existing + n)
        } else {
            if existing > 0 {
                debug!("server does not support ranges, downloading from start");
            }
            let mut file = tokio::fs::File::create(path).await?;
            self.fetch(&mut file, None, 0).await
        };
        self.progress.mark_complete();
        result
    }

    /// `already` counts bytes the destination held before this request.
    async fn fetch<W: AsyncWrite + Unpin + Send>(
        &mut self,
        writer: &mut W,
        range: Option<RangeRequest>,
        already: u64,
    ) -> Result<u64, TransferError> {
        let spec = self.prepare().await?;
        if range.is_some() && !spec.supports_range_requests {
            return Err(TransferError::Config(
                "download does not support range requests".into(),
            ));
        }

        let mut request = HttpRequest::get(spec.download_url.clone());
        if let Some(range) = &range {
            request = request.with_header("Range", range.header_value());
        }

        self.pause.wait(&self.cancel).await?;
        let response = self.executor.execute(request).await?;
        if !matches!(response.status, 200 | 206) {
            let status = response.status;
            let body = response.bytes().await.unwrap_or_default();
            return Err(TransferError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        // Servers may ignore `Range` and answer 200 with the whole item;
        // the requested span is then cut out of the full body.
        let (mut skip, mut keep) = match &range {
            Some(range) if response.status == 200 => {
                warn!(range = %range.header_value(), "server ignored range request");
                let end = range.end.map(|end| end.saturating_add(1).saturating_sub(range.begin));
                (range.begin, end)
            }
            _ => (0, None),
        };

        let expected = match &range {
            Some(range) => range.expected_length(self.item.size),
            None => self.item.size.or(response.content_length()),
        };
        if let Some(expected) = expected {
            self.progress.set_total_bytes(already + expected);
        }

        let mut body = response.body;
        let mut total = 0u64;
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let mut chunk = chunk?;
            if skip > 0 {
                let n = skip.min(chunk.len() as u64);
                skip -= n;
                chunk = chunk.slice(n as usize..);
            }
            if let Some(left) = keep {
                chunk.truncate(left.min(chunk.len() as u64) as usize);
                keep = Some(left - chunk.len() as u64);
            }
            for piece in chunk.chunks(self.config.buffer_size) {
                self.pause.wait(&self.cancel).await?;
                writer.write_all(piece).await?;
                total += piece.len() as u64;
                self.progress.report(piece.len() as i64);
            }
            if keep == Some(0) {
                break;
            }
        }
        writer.flush().await?;

        if let Some(expected) = expected {
            let ranged = range.is_some();
            check_length(expected, total, ranged, self.config.allow_range_request_off_by_one)?;
        }
        debug!(bytes = total, "download finished");
        Ok(total)
    }
}

fn check_length(
    expected: u64,
    actual: u64,
    ranged: bool,
    allow_off_by_one: bool,
) -> Result<(), TransferError> {
    if actual == expected {
        return Ok(());
    }
    if ranged && allow_off_by_one && actual + 1 == expected {
        warn!(expected, actual, "range response one byte short, accepting");
        return Ok(());
    }
    Err(TransferError::LengthMismatch { expected, actual })
}
