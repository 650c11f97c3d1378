use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{lock, read, write};

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub bytes_remaining: u64,
    pub complete: bool,
    pub metadata: HashMap<String, String>,
}

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(&TransferProgress) + Send + Sync>;

/// Accumulates transferred bytes and notifies subscribers.
///
/// Cheap to clone; clones share the same counters. Deltas may be negative
/// when a failed attempt's bytes are rolled back. Notifications are
/// throttled to one per interval, except [`mark_complete`](Self::mark_complete)
/// and [`reset`](Self::reset) which always notify.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    transfer_id: String,
    total_bytes: AtomicU64,
    transferred: AtomicI64,
    complete: AtomicBool,
    metadata: RwLock<HashMap<String, String>>,
    callbacks: RwLock<Vec<ProgressCallback>>,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("transfer_id", &self.inner.transfer_id)
            .field("total_bytes", &self.total_bytes())
            .field("bytes_transferred", &self.bytes_transferred())
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(total_bytes: u64, interval: Duration) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                transfer_id: uuid::Uuid::new_v4().to_string(),
                total_bytes: AtomicU64::new(total_bytes),
                transferred: AtomicI64::new(0),
                complete: AtomicBool::new(false),
                metadata: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
                interval,
                last_emit: Mutex::new(None),
            }),
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.inner.transfer_id
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        write(&self.inner.callbacks).push(callback);
    }

    /// Attaches caller metadata carried in every snapshot.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        write(&self.inner.metadata).insert(key.into(), value.into());
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Acquire)
    }

    /// Updates the total once it becomes known (e.g. from a response).
    pub fn set_total_bytes(&self, total: u64) {
        self.inner.total_bytes.store(total, Ordering::Release);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Acquire).max(0) as u64
    }

    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Adds `delta` bytes (negative to roll back) and notifies if due.
    pub fn report(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.inner.transferred.fetch_add(delta, Ordering::AcqRel);
        if self.due() {
            self.emit();
        }
    }

    /// Zeroes the counter, e.g. when an upload restarts from scratch.
    pub fn reset(&self) {
        self.inner.transferred.store(0, Ordering::Release);
        self.inner.complete.store(false, Ordering::Release);
        self.emit();
    }

    /// Marks the transfer finished and always notifies.
    pub fn mark_complete(&self) {
        self.inner.complete.store(true, Ordering::Release);
        self.emit();
    }

    pub fn snapshot(&self) -> TransferProgress {
        let total_bytes = self.total_bytes();
        let bytes_transferred = self.bytes_transferred();
        TransferProgress {
            transfer_id: self.inner.transfer_id.clone(),
            total_bytes,
            bytes_transferred,
            bytes_remaining: total_bytes.saturating_sub(bytes_transferred),
            complete: self.is_complete(),
            metadata: read(&self.inner.metadata).clone(),
        }
    }

    fn due(&self) -> bool {
        let mut last = lock(&self.inner.last_emit);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.inner.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn emit(&self) {
        *lock(&self.inner.last_emit) = Some(Instant::now());
        let callbacks = read(&self.inner.callbacks);
        if callbacks.is_empty() {
            return;
        }
        let progress = self.snapshot();
        for cb in callbacks.iter() {
            cb(&progress);
        }
    }
}
