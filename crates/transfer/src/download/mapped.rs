//! Download into a memory-mapped destination that can be read while it fills.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use memmap2::MmapMut;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tracing::debug;

use super::FileDownloader;
use crate::{TransferError, lock};

/// Downloads an item of known size straight into a mapped file.
///
/// [`MappedReader`]s handed out before or during the download can read any
/// range; reads beyond what has landed wait until the contiguous written
/// prefix covers them, and fail if the download fails.
pub struct MappedFileDownloader {
    downloader: FileDownloader,
    path: PathBuf,
    shared: Arc<Mutex<MappedState>>,
}

struct MappedState {
    map: Option<MmapMut>,
    size: u64,
    written: u64,
    finished: bool,
    failure: Option<String>,
    waiting: Vec<PendingRead>,
}

struct PendingRead {
    offset: u64,
    length: u64,
    reply: oneshot::Sender<Result<Bytes, TransferError>>,
}

impl MappedState {
    fn copy_out(&self, offset: u64, length: u64) -> Bytes {
        match &self.map {
            Some(map) => Bytes::copy_from_slice(&map[offset as usize..(offset + length) as usize]),
            None => Bytes::new(),
        }
    }

    /// Answers every queued read that can now be answered.
    fn serve_waiting(&mut self) {
        let waiting = std::mem::take(&mut self.waiting);
        for read in waiting {
            if read.offset + read.length <= self.written {
                let data = self.copy_out(read.offset, read.length);
                let _ = read.reply.send(Ok(data));
            } else if let Some(reason) = &self.failure {
                let _ = read.reply.send(Err(TransferError::Http(reason.clone())));
            } else if self.finished {
                let _ = read.reply.send(Err(TransferError::LengthMismatch {
                    expected: read.offset + read.length,
                    actual: self.written,
                }));
            } else {
                self.waiting.push(read);
            }
        }
    }
}

impl MappedFileDownloader {
    /// `downloader` must know the item size.
    pub fn new(downloader: FileDownloader, path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let size = downloader.item().size.ok_or_else(|| {
            TransferError::Config("mapped download needs the item size".into())
        })?;
        Ok(Self {
            downloader,
            path: path.as_ref().to_path_buf(),
            shared: Arc::new(Mutex::new(MappedState {
                map: None,
                size,
                written: 0,
                finished: false,
                failure: None,
                waiting: Vec::new(),
            })),
        })
    }

    /// Handle for reading the destination while it downloads.
    pub fn reader(&self) -> MappedReader {
        MappedReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn downloader(&self) -> &FileDownloader {
        &self.downloader
    }

    /// Runs the download. Returns the number of bytes written.
    pub async fn download(&mut self) -> Result<u64, TransferError> {
        self.downloader.config.validate()?;
        let size = lock(&self.shared).size;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.set_len(size)?;

        if size > 0 {
            // SAFETY: the file was just created and sized by us; the mapping
            // is only touched under the state lock.
            let map = unsafe { MmapMut::map_mut(&file)? };
            lock(&self.shared).map = Some(map);
        }

        let mut writer = MappedWriter {
            shared: Arc::clone(&self.shared),
            position: 0,
        };
        let result = self.downloader.download_to(&mut writer, None).await;

        let mut state = lock(&self.shared);
        let result = result.and_then(|bytes| match &state.map {
            Some(map) => map.flush().map(|_| bytes).map_err(TransferError::from),
            None => Ok(bytes),
        });
        match &result {
            Ok(bytes) => debug!(path = %self.path.display(), bytes, "mapped download finished"),
            Err(e) => state.failure = Some(e.to_string()),
        }
        state.finished = true;
        state.serve_waiting();
        result
    }
}

/// Reads from a [`MappedFileDownloader`]'s destination.
#[derive(Clone)]
pub struct MappedReader {
    shared: Arc<Mutex<MappedState>>,
}

impl MappedReader {
    /// Reads `length` bytes at `offset`, waiting for them to arrive.
    ///
    /// Reads past the end of the file are cut short at the end.
    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Bytes, TransferError> {
        let rx = {
            let mut state = lock(&self.shared);
            let offset = offset.min(state.size);
            let length = length.min(state.size - offset);
            if offset + length <= state.written {
                return Ok(state.copy_out(offset, length));
            }
            let (reply, rx) = oneshot::channel();
            state.waiting.push(PendingRead {
                offset,
                length,
                reply,
            });
            state.serve_waiting();
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(TransferError::Http("download dropped".into())))
    }

    /// Bytes available from the start of the file.
    pub fn available(&self) -> u64 {
        lock(&self.shared).written
    }

    pub fn size(&self) -> u64 {
        lock(&self.shared).size
    }
}

/// Sequential writer into the mapping.
struct MappedWriter {
    shared: Arc<Mutex<MappedState>>,
    position: u64,
}

impl AsyncWrite for MappedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let position = self.position;
        let mut state = lock(&self.shared);
        let end = position + buf.len() as u64;
        if end > state.size {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("response exceeds expected size {}", state.size),
            )));
        }
        if let Some(map) = state.map.as_mut() {
            map[position as usize..end as usize].copy_from_slice(buf);
        }
        state.written = end;
        state.serve_waiting();
        drop(state);
        self.position = end;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
