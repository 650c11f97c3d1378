use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::ERROR_CODE_INVALID_UPLOAD_ID;

/// Errors produced while interpreting a response envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("envelope carries no value")]
    MissingValue,
}

impl EnvelopeError {
    /// Returns `true` if the server rejected the upload id itself.
    pub fn is_invalid_upload_id(&self) -> bool {
        matches!(self, Self::Server { code, .. } if *code == ERROR_CODE_INVALID_UPLOAD_ID)
    }
}

/// Envelope wrapping chunk, standard-upload and finish responses.
///
/// `value` is kept as raw JSON so callers decide what it contains, the same
/// way request payloads are deferred until the handler knows their type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Box<serde_json::value::RawValue>>,
}

impl ResponseEnvelope {
    /// Parses an envelope from a raw response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Creates a successful envelope around `value`.
    pub fn success<T: Serialize>(value: Option<&T>) -> Result<Self, serde_json::Error> {
        let raw = match value {
            Some(v) => {
                let json = serde_json::to_string(v)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            error: false,
            error_code: 0,
            error_message: None,
            value: raw,
        })
    }

    /// Creates an error envelope.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_code: code,
            error_message: Some(message.into()),
            value: None,
        }
    }

    /// Returns an error if the server flagged this response as failed.
    pub fn check(&self) -> Result<(), EnvelopeError> {
        if self.error {
            return Err(EnvelopeError::Server {
                code: self.error_code,
                message: self.error_message.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Checks the error flag and deserializes the value.
    pub fn into_value<T: DeserializeOwned>(self) -> Result<T, EnvelopeError> {
        self.check()?;
        match self.value {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Err(EnvelopeError::MissingValue),
        }
    }
}
