use serde::{Deserialize, Serialize};

/// Upload strategy negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadMethod {
    /// One request carrying the whole file.
    Standard,
    /// Many concurrent part requests followed by a finish call.
    Threaded,
}

/// Server-issued descriptor for one upload session.
///
/// Immutable once issued; a session-invalid error replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadSpecification {
    pub method: UploadMethod,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prepare_uri: String,
    pub chunk_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finish_uri: String,
    #[serde(default)]
    pub is_resume: bool,
    #[serde(default)]
    pub resume_index: u64,
    #[serde(default)]
    pub resume_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_file_hash: Option<String>,
    #[serde(default = "default_max_threads")]
    pub max_number_of_threads: usize,
}

fn default_max_threads() -> usize {
    1
}

/// Body of the request asking the server to open an upload session.
///
/// `parent_uri` addresses the folder and is carried in the URL, not the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadSpecificationRequest {
    #[serde(skip)]
    pub parent_uri: String,
    pub file_name: String,
    pub file_length: u64,
    pub method: UploadMethod,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default = "default_max_threads")]
    pub thread_count: usize,
}

/// Server-issued descriptor for a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DownloadSpecification {
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_token: Option<String>,
    #[serde(default = "default_true")]
    pub supports_range_requests: bool,
}

fn default_true() -> bool {
    true
}

impl DownloadSpecification {
    /// Builds a specification that streams straight from `url`.
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            download_url: url.into(),
            download_token: None,
            supports_range_requests: true,
        }
    }
}

/// Provider capabilities relevant to transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ThreadedUploads,
    StandardUploadRaw,
    DownloadSpecification,
    #[serde(other)]
    Other,
}

/// One entry of the capabilities feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilityEntry {
    pub name: Capability,
}

/// Feed returned by the capabilities endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFeed {
    #[serde(default)]
    pub value: Vec<CapabilityEntry>,
}

impl CapabilityFeed {
    /// Flattens the feed into capability names, dropping unknown ones.
    pub fn into_capabilities(self) -> Vec<Capability> {
        self.value
            .into_iter()
            .map(|e| e.name)
            .filter(|c| *c != Capability::Other)
            .collect()
    }
}

/// Metadata of a stored item, as returned by a finished upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadedItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    pub file_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_specification_from_server_json() {
        let json = r#"{
            "Method": "Threaded",
            "ChunkUri": "https://up.example.com/upload-threaded-3.aspx?uploadid=abc",
            "FinishUri": "https://up.example.com/upload-threaded-3.aspx?uploadid=abc&finish=true",
            "IsResume": true,
            "ResumeIndex": 3,
            "ResumeOffset": 3145728,
            "ResumeFileHash": "0cc175b9c0f1b6a831c399e269772661",
            "MaxNumberOfThreads": 4
        }"#;
        let spec: UploadSpecification = serde_json::from_str(json).unwrap();
        assert_eq!(spec.method, UploadMethod::Threaded);
        assert!(spec.is_resume);
        assert_eq!(spec.resume_index, 3);
        assert_eq!(spec.resume_offset, 3_145_728);
        assert_eq!(spec.max_number_of_threads, 4);
        assert!(spec.prepare_uri.is_empty());
    }

    #[test]
    fn upload_specification_defaults() {
        let json = r#"{"Method":"Standard","ChunkUri":"https://up.example.com/u?id=1"}"#;
        let spec: UploadSpecification = serde_json::from_str(json).unwrap();
        assert!(!spec.is_resume);
        assert_eq!(spec.resume_offset, 0);
        assert!(spec.resume_file_hash.is_none());
        assert_eq!(spec.max_number_of_threads, 1);
    }

    #[test]
    fn spec_request_skips_parent_uri() {
        let req = UploadSpecificationRequest {
            parent_uri: "https://api.example.com/Items(foh1)".into(),
            file_name: "movie.mkv".into(),
            file_length: 42,
            method: UploadMethod::Threaded,
            raw: true,
            overwrite: false,
            title: String::new(),
            details: String::new(),
            thread_count: 4,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("ParentUri").is_none());
        assert_eq!(value["FileName"], "movie.mkv");
        assert_eq!(value["Method"], "Threaded");
        assert!(value.get("Title").is_none());
    }

    #[test]
    fn unknown_capabilities_are_dropped() {
        let json = r#"{"value":[{"Name":"ThreadedUploads"},{"Name":"AdvancedSearch"},{"Name":"DownloadSpecification"}]}"#;
        let feed: CapabilityFeed = serde_json::from_str(json).unwrap();
        let caps = feed.into_capabilities();
        assert_eq!(
            caps,
            vec![Capability::ThreadedUploads, Capability::DownloadSpecification]
        );
    }

    #[test]
    fn download_specification_defaults_to_range_support() {
        let json = r#"{"DownloadUrl":"https://dl.example.com/f?token=t"}"#;
        let spec: DownloadSpecification = serde_json::from_str(json).unwrap();
        assert!(spec.supports_range_requests);
        assert!(spec.download_token.is_none());
        assert_eq!(spec, DownloadSpecification::direct("https://dl.example.com/f?token=t"));
    }
}
