//! Storage API client.
//!
//! Async HTTP client using `reqwest` with Bearer token authentication.

use std::time::Duration;

use cloudshare_protocol::{
    Capability, CapabilityFeed, DownloadSpecification, UploadSpecification,
    UploadSpecificationRequest,
};
use cloudshare_transfer::TransferError;
use cloudshare_transfer::http::{BoxFuture, TransferApi, append_query};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const MAX_REDIRECTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the REST client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid access token")]
    InvalidToken,
}

impl From<Error> for TransferError {
    fn from(err: Error) -> Self {
        match err {
            Error::Http(e) => TransferError::Http(e.to_string()),
            Error::Api { status, body } => TransferError::Status { status, body },
            Error::Json(e) => TransferError::Json(e),
            Error::InvalidToken => TransferError::Config(Error::InvalidToken.to_string()),
        }
    }
}

/// Storage API client.
///
/// Relative URIs are resolved against the base URL; absolute ones (as
/// handed out in specifications) are used as-is. Redirects are followed.
pub struct RestClient {
    pub(crate) http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Creates a client for the API at `base_url` authenticating with `token`.
    pub fn new(base_url: &str, token: &str) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| Error::InvalidToken)?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("{}/{}", self.base_url, uri.trim_start_matches('/'))
        }
    }

    /// API root serving `uri`: everything before its `/Items(` segment.
    fn provider_root(&self, uri: &str) -> String {
        let uri = self.resolve(uri);
        match uri.find("/Items(") {
            Some(idx) => uri[..idx].to_string(),
            None => self.base_url.clone(),
        }
    }

    /// Opens an upload session in the folder named by `request.parent_uri`.
    pub async fn request_upload(
        &self,
        request: &UploadSpecificationRequest,
    ) -> Result<UploadSpecification, Error> {
        let url = format!("{}/Upload2", self.resolve(&request.parent_uri));
        debug!(
            %url,
            file = %request.file_name,
            method = ?request.method,
            "requesting upload specification"
        );
        self.post_json(&url, request).await
    }

    /// Asks for a download URL instead of being redirected to the content.
    pub async fn request_download(&self, item_uri: &str) -> Result<DownloadSpecification, Error> {
        let url = append_query(
            &format!("{}/Download", self.resolve(item_uri)),
            &[("redirect", "false")],
        );
        self.get_json(&url).await
    }

    pub async fn list_capabilities(&self, uri: &str) -> Result<Vec<Capability>, Error> {
        let url = format!("{}/Capabilities", self.provider_root(uri));
        let feed: CapabilityFeed = self.get_json(&url).await?;
        Ok(feed.into_capabilities())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let resp = self.http.get(url).send().await?;
        read_json(resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, Error> {
        let resp = self.http.post(url).json(body).send().await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Api {
            status: status.as_u16(),
            body,
        });
    }
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

impl TransferApi for RestClient {
    fn upload_specification<'a>(
        &'a self,
        request: &'a UploadSpecificationRequest,
    ) -> BoxFuture<'a, Result<UploadSpecification, TransferError>> {
        Box::pin(async move { Ok(self.request_upload(request).await?) })
    }

    fn download_specification<'a>(
        &'a self,
        item_uri: &'a str,
    ) -> BoxFuture<'a, Result<DownloadSpecification, TransferError>> {
        Box::pin(async move { Ok(self.request_download(item_uri).await?) })
    }

    fn capabilities<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Capability>, TransferError>> {
        Box::pin(async move { Ok(self.list_capabilities(uri).await?) })
    }
}
