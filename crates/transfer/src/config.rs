//! Transfer configuration.
//!
//! All sections deserialize with defaults for missing fields, so a config
//! file only needs to name what it overrides:
//!
//! ```json
//! { "upload": { "numberOfThreads": 8, "part": { "partRetryCount": 3 } } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::TransferError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Part sizing and retry policy for threaded uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilePartConfig {
    pub initial_part_size: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
    #[serde(with = "duration_millis")]
    pub target_part_upload_time: Duration,
    pub max_part_size_increase_factor: f64,
    pub max_part_size_decrease_factor: f64,
    /// Retries per part after the first attempt.
    pub part_retry_count: u32,
    /// Files smaller than this upload with a single worker.
    pub min_file_size_for_multithreaded: u64,
}

impl Default for FilePartConfig {
    fn default() -> Self {
        Self {
            initial_part_size: MIB,
            min_part_size: 4 * KIB,
            max_part_size: 8 * MIB,
            target_part_upload_time: Duration::from_secs(15),
            max_part_size_increase_factor: 8.0,
            max_part_size_decrease_factor: 2.0,
            part_retry_count: 1,
            min_file_size_for_multithreaded: 8 * MIB,
        }
    }
}

impl FilePartConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.min_part_size == 0 {
            return Err(TransferError::Config("min part size must be positive".into()));
        }
        if self.min_part_size > self.max_part_size {
            return Err(TransferError::Config(format!(
                "min part size {} exceeds max part size {}",
                self.min_part_size, self.max_part_size
            )));
        }
        if !(self.min_part_size..=self.max_part_size).contains(&self.initial_part_size) {
            return Err(TransferError::Config(format!(
                "initial part size {} outside [{}, {}]",
                self.initial_part_size, self.min_part_size, self.max_part_size
            )));
        }
        if !(self.max_part_size_increase_factor >= 1.0 && self.max_part_size_decrease_factor >= 1.0)
        {
            return Err(TransferError::Config(
                "part size factors must be at least 1".into(),
            ));
        }
        if self.target_part_upload_time.is_zero() {
            return Err(TransferError::Config(
                "target part upload time must be positive".into(),
            ));
        }
        if self.min_file_size_for_multithreaded == 0 {
            return Err(TransferError::Config(
                "min file size for multithreading must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Uploader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploaderConfig {
    pub number_of_threads: usize,
    pub part: FilePartConfig,
    /// Files below this size use a single standard request.
    pub standard_upload_threshold: u64,
    /// Whole-file attempts for standard uploads.
    pub standard_upload_attempts: u32,
    /// Send part bodies raw instead of as multipart forms.
    pub raw: bool,
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,
    pub pool_buffers: bool,
    pub max_retained_buffers: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            number_of_threads: 4,
            part: FilePartConfig::default(),
            standard_upload_threshold: 8 * MIB,
            standard_upload_attempts: 3,
            raw: true,
            progress_interval: Duration::from_millis(250),
            pool_buffers: true,
            max_retained_buffers: crate::buffer::DEFAULT_MAX_RETAINED,
        }
    }
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.number_of_threads == 0 {
            return Err(TransferError::Config("thread count must be positive".into()));
        }
        if self.standard_upload_attempts == 0 {
            return Err(TransferError::Config(
                "standard upload needs at least one attempt".into(),
            ));
        }
        self.part.validate()
    }
}

/// Downloader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloaderConfig {
    /// Size of the copy buffer between response and destination.
    pub buffer_size: usize,
    /// Accept a range response one byte short of the requested span.
    pub allow_range_request_off_by_one: bool,
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * KIB as usize,
            allow_range_request_off_by_one: false,
            progress_interval: Duration::from_millis(250),
        }
    }
}

impl DownloaderConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.buffer_size == 0 {
            return Err(TransferError::Config("buffer size must be positive".into()));
        }
        Ok(())
    }
}

/// Complete transfer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub upload: UploaderConfig,
    pub download: DownloaderConfig,
}

impl TransferConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields defaults; an unparsable one is logged and
    /// replaced by defaults. Values that parse but are inconsistent are an
    /// error.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = match serde_json::from_str::<TransferConfig>(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        self.upload.validate()?;
        self.download.validate()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
