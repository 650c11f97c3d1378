/// Server error code reported when an upload id is unknown or expired.
///
/// A chunk rejected with this code is never retried: the whole session is
/// gone and the upload must start over with a fresh specification.
pub const ERROR_CODE_INVALID_UPLOAD_ID: i32 = 605;

/// Query value asking the finish endpoint to answer with a JSON envelope.
pub const RESPONSE_FORMAT_JSON: &str = "json";

/// Multipart form field name carrying file bytes.
pub const MULTIPART_FILE_FIELD: &str = "File1";
