use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Cooperative pause switch shared between a controller and a transfer.
///
/// Transfers call [`wait`](Self::wait) at checkpoints; while paused the call
/// blocks until resumed or cancelled.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns once the gate is open, or `Cancelled` if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let mut rx = self.tx.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
