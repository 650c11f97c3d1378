//! Adaptive, resumable, concurrent chunked transfers.
//!
//! Uploads split a file into parts whose size follows the observed
//! throughput, send them over a bounded pool of workers and finish with
//! the whole-file MD5. Failures carry an [`ActiveUploadState`] to resume
//! from. Downloads stream (optionally ranged) responses into any writer
//! and verify the length received.
//!
//! HTTP and the server API are reached through the [`HttpExecutor`] and
//! [`TransferApi`] traits.

pub mod buffer;
pub mod config;
pub mod download;
mod error;
pub mod hash;
pub mod http;
pub mod part_size;
pub mod pause;
pub mod progress;
pub mod ranges;
pub mod source;
mod types;
pub mod upload;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use buffer::{BufferAllocator, BufferPool, HeapAllocator, PartBuffer, PoolStats};
pub use config::{DownloaderConfig, FilePartConfig, TransferConfig, UploaderConfig};
pub use download::{DownloadItem, FileDownloader, MappedFileDownloader, MappedReader};
pub use error::{FailureKind, TransferError, UploadError};
pub use hash::IncrementalHasher;
pub use http::{HttpExecutor, HttpRequest, HttpResponse, Method, RequestBody, TransferApi};
pub use part_size::PartSizeCalculator;
pub use pause::PauseGate;
pub use progress::{ProgressCallback, ProgressReporter, TransferProgress};
pub use ranges::CompletedRangeTracker;
pub use source::FilePartSource;
pub use types::{ActiveUploadState, FilePart, RangeRequest, UploadResponse, UploadStatus};
pub use upload::{
    FileUploader, ScalingPartUploader, ScalingUploader, StandardUploader, UploadRequest,
    UploadSource,
};

// Critical sections never panic midway, so a poisoned lock still holds
// consistent data.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
