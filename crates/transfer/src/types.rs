use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cloudshare_protocol::{UploadSpecification, UploadedItem};

/// One unit of upload work.
///
/// `data` is backed by a pooled buffer that returns to its pool once the
/// part (and every in-flight request body cloned from it) is dropped.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Sequential part number, continuing from the resume index.
    pub index: u64,
    /// Byte offset within the file.
    pub offset: u64,
    pub length: u64,
    /// Hex MD5 of `data`.
    pub hash: String,
    pub is_last_part: bool,
    pub data: Bytes,
}

/// Durable resume token for an interrupted threaded upload.
///
/// Callers may persist it and later seed a new uploader with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUploadState {
    pub specification: UploadSpecification,
    /// Length of the gap-free prefix the server acknowledged.
    pub bytes_uploaded: u64,
    /// Index of the part starting at `bytes_uploaded`.
    #[serde(default)]
    pub next_part_index: u64,
}

impl ActiveUploadState {
    /// Specification rewritten so the upload continues at `bytes_uploaded`.
    ///
    /// The resume hash is cleared: the prefix is our own record, so there
    /// is no server hash to compare it against.
    pub fn resume_specification(&self) -> UploadSpecification {
        let mut spec = self.specification.clone();
        spec.is_resume = self.bytes_uploaded > 0;
        spec.resume_offset = self.bytes_uploaded;
        spec.resume_index = self.next_part_index;
        spec.resume_file_hash = None;
        spec
    }
}

/// Inclusive byte range for a download; `end == None` means to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub begin: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl RangeRequest {
    pub fn new(begin: u64, end: Option<u64>) -> Self {
        Self { begin, end }
    }

    /// Range from `begin` to the end of the file.
    pub fn from_offset(begin: u64) -> Self {
        Self { begin, end: None }
    }

    /// Value for the `Range` request header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.begin, end),
            None => format!("bytes={}-", self.begin),
        }
    }

    /// Bytes the server should send, if known.
    ///
    /// Open-ended ranges need the full item size to be answerable. With a
    /// known size the range stops at the last byte of the item.
    pub fn expected_length(&self, total_size: Option<u64>) -> Option<u64> {
        if let Some(size) = total_size
            && self.begin >= size
        {
            return Some(0);
        }
        let last = match (self.end, total_size) {
            (Some(end), Some(size)) => end.min(size - 1),
            (Some(end), None) => end,
            (None, Some(size)) => size - 1,
            (None, None) => return None,
        };
        Some(last.saturating_sub(self.begin) + 1)
    }
}

/// Lifecycle of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    NotPrepared,
    /// Specification obtained and resume point checked.
    Prepared,
    InProgress,
    Finished,
    /// `resumable` is set when an [`ActiveUploadState`] was produced.
    Failed { resumable: bool },
}

/// Successful outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    /// Items the server created or updated.
    pub items: Vec<UploadedItem>,
    /// Hex MD5 of the uploaded file as computed locally.
    pub file_hash: String,
}
