fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use cloudshare_protocol::{
        Capability, CapabilityFeed, DownloadSpecification, ResponseEnvelope, UploadMethod,
        UploadSpecification, UploadSpecificationRequest, UploadedItem,
    };
    use cloudshare_transfer::{ActiveUploadState, TransferConfig, TransferError};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Reads a fixture file.
    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Servers write `4` where `f64` fields serialize as `4.0`.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let data = read_fixture(name);
        let fixture: serde_json::Value = serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"));
        let parsed: T = serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized: serde_json::Value = serde_json::to_string(&parsed)
            .and_then(|s| serde_json::from_str(&s))
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  ours: {reserialized}"
        );
        parsed
    }

    // --- Specifications ---

    #[test]
    fn fixture_upload_specification_threaded_resume() {
        let spec: UploadSpecification = roundtrip_test("upload_specification.json");
        assert_eq!(spec.method, UploadMethod::Threaded);
        assert!(spec.is_resume);
        assert_eq!(spec.resume_offset, 12 * 1024 * 1024);
        assert_eq!(spec.resume_index, 12);
    }

    #[test]
    fn fixture_upload_specification_standard() {
        let spec: UploadSpecification = roundtrip_test("upload_specification_standard.json");
        assert_eq!(spec.method, UploadMethod::Standard);
        assert!(spec.finish_uri.is_empty());
        assert!(spec.resume_file_hash.is_none());
    }

    #[test]
    fn fixture_upload_specification_request() {
        let req: UploadSpecificationRequest = roundtrip_test("upload_specification_request.json");
        assert!(req.parent_uri.is_empty(), "parent uri travels in the URL");
        assert_eq!(req.thread_count, 4);
    }

    #[test]
    fn fixture_download_specification() {
        let spec: DownloadSpecification = roundtrip_test("download_specification.json");
        assert_eq!(spec.download_token.as_deref(), Some("dt5b1c"));
    }

    #[test]
    fn fixture_capability_feed() {
        let feed: CapabilityFeed = roundtrip_test("capability_feed.json");
        assert!(feed.into_capabilities().contains(&Capability::ThreadedUploads));
    }

    // --- Envelopes ---

    #[test]
    fn fixture_envelope_uploaded_items() {
        let env: ResponseEnvelope = roundtrip_test("envelope_uploaded_items.json");
        let items: Vec<UploadedItem> = env.into_value().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, 734_003_200);
        assert_eq!(items[0].upload_id, "rsu-8c2f");
    }

    #[test]
    fn fixture_envelope_invalid_upload_id() {
        let env: ResponseEnvelope = roundtrip_test("envelope_invalid_upload_id.json");
        let body = serde_json::to_vec(&env).unwrap();
        let err = env.check().unwrap_err();
        assert!(err.is_invalid_upload_id());
        assert!(matches!(
            TransferError::from_envelope(err, &body),
            TransferError::InvalidUploadId(_)
        ));
    }

    // --- Transfer engine persistence ---

    #[test]
    fn fixture_active_upload_state() {
        let state: ActiveUploadState = roundtrip_test("active_upload_state.json");
        let spec = state.resume_specification();
        assert!(spec.is_resume);
        assert_eq!(spec.resume_offset, 6 * 1024 * 1024);
        assert_eq!(spec.resume_index, 6);
    }

    #[test]
    fn fixture_transfer_config() {
        let config: TransferConfig = roundtrip_test("transfer_config.json");
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.number_of_threads, 8);
        assert!(config.download.allow_range_request_off_by_one);
    }

    // --- Backward compatibility: sparse server JSON ---

    #[test]
    fn unknown_capabilities_are_ignored() {
        let json = r#"{"value":[{"Name":"ThreadedUploads"},{"Name":"WebAppUpload"}]}"#;
        let feed: CapabilityFeed = serde_json::from_str(json).unwrap();
        assert_eq!(feed.into_capabilities(), vec![Capability::ThreadedUploads]);
    }

    #[test]
    fn legacy_download_specification_without_range_flag() {
        let json = r#"{"DownloadUrl":"https://storage.example.com/d?dt=1"}"#;
        let spec: DownloadSpecification = serde_json::from_str(json).unwrap();
        assert!(
            spec.supports_range_requests,
            "missing range flag should default to true"
        );
    }

    #[test]
    fn active_upload_state_without_part_index() {
        let json = r#"{
            "specification": {"Method":"Threaded","ChunkUri":"https://s/u?id=1"},
            "bytesUploaded": 4096
        }"#;
        let state: ActiveUploadState = serde_json::from_str(json).unwrap();
        assert_eq!(state.next_part_index, 0, "missing field should default to 0");
        assert_eq!(state.specification.max_number_of_threads, 1);
    }

    #[test]
    fn partial_transfer_config_keeps_defaults() {
        let json = r#"{"upload":{"numberOfThreads":2}}"#;
        let config: TransferConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.upload.number_of_threads, 2);
        assert_eq!(config.download, TransferConfig::default().download);
        assert_eq!(config.upload.part, TransferConfig::default().upload.part);
    }
}
