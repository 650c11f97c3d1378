//! Error taxonomy for transfers.

use cloudshare_protocol::EnvelopeError;
use cloudshare_protocol::constants::ERROR_CODE_INVALID_UPLOAD_ID;

use crate::types::ActiveUploadState;

/// Coarse classification deciding what a caller can do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip, timeout or ordinary server error; retry or resume.
    Transient,
    /// The upload session no longer exists; start over.
    SessionInvalid,
    /// The caller cancelled.
    Cancelled,
    /// The server answered with something we could not interpret.
    Malformed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "error",
            Self::SessionInvalid => "session invalid",
            Self::Cancelled => "cancelled",
            Self::Malformed => "malformed response",
        };
        f.write_str(s)
    }
}

/// Errors produced by transfer primitives.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("server error {code}: {message}")]
    Api { code: i32, message: String },

    #[error("upload session is no longer valid: {0}")]
    InvalidUploadId(String),

    #[error("malformed response: {reason}")]
    Malformed { reason: String, body: String },

    #[error("cancelled")]
    Cancelled,

    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidUploadId(_) => FailureKind::SessionInvalid,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Malformed { .. } => FailureKind::Malformed,
            _ => FailureKind::Transient,
        }
    }

    /// Interprets an envelope failure, keeping `body` for diagnostics.
    pub fn from_envelope(err: EnvelopeError, body: &[u8]) -> Self {
        match err {
            EnvelopeError::Server { code, message } if code == ERROR_CODE_INVALID_UPLOAD_ID => {
                Self::InvalidUploadId(message)
            }
            EnvelopeError::Server { code, message } => Self::Api { code, message },
            EnvelopeError::Json(e) => Self::Malformed {
                reason: e.to_string(),
                body: String::from_utf8_lossy(body).into_owned(),
            },
            EnvelopeError::MissingValue => Self::Malformed {
                reason: "envelope carries no value".into(),
                body: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

/// Terminal failure of an upload.
///
/// Carries the resume token when the upload can continue where it stopped.
#[derive(Debug, thiserror::Error)]
#[error("upload {kind}: {source}")]
pub struct UploadError {
    pub kind: FailureKind,
    pub state: Option<ActiveUploadState>,
    #[source]
    pub source: TransferError,
}

impl UploadError {
    /// Wraps `source` without resume state.
    pub fn new(source: TransferError) -> Self {
        Self {
            kind: source.kind(),
            state: None,
            source,
        }
    }

    /// Wraps `source` together with the point to resume from.
    pub fn resumable(source: TransferError, state: ActiveUploadState) -> Self {
        Self {
            kind: source.kind(),
            state: Some(state),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl From<TransferError> for UploadError {
    fn from(source: TransferError) -> Self {
        Self::new(source)
    }
}
