//! Streaming MD5 used for per-part and whole-file integrity.

use md5::{Digest, Md5};

/// Append-then-finalize MD5 hasher.
///
/// One instance is created per part; a single long-lived instance covers
/// the whole file and is shared behind a lock because parts are claimed
/// by many workers.
#[derive(Clone)]
pub struct IncrementalHasher {
    state: Option<Md5>,
    computed: Option<String>,
}

impl std::fmt::Debug for IncrementalHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalHasher")
            .field("finalized", &self.computed.is_some())
            .finish()
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            state: Some(Md5::new()),
            computed: None,
        }
    }

    /// Feeds more bytes into the running digest.
    ///
    /// Bytes appended after [`finalize`](Self::finalize) are ignored.
    pub fn append(&mut self, data: &[u8]) {
        if let Some(state) = self.state.as_mut() {
            state.update(data);
        }
    }

    /// Feeds a final (possibly empty) slice and seals the digest.
    pub fn finalize(&mut self, data: &[u8]) {
        if let Some(mut state) = self.state.take() {
            state.update(data);
            self.computed = Some(hex::encode(state.finalize()));
        }
    }

    /// Returns the lowercase hex digest once finalized.
    pub fn computed_hash(&self) -> Option<&str> {
        self.computed.as_deref()
    }

    /// Returns `true` once [`finalize`](Self::finalize) has been called.
    pub fn is_finalized(&self) -> bool {
        self.computed.is_some()
    }
}

/// Computes the hex MD5 of `data` in one shot.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
