use std::io;

use cloudshare_transfer::TransferError;
use cloudshare_transfer::http::{
    BoxFuture, HttpExecutor, HttpRequest, HttpResponse, Method, RequestBody,
};
use futures_util::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use tracing::trace;

use crate::client::{Error, RestClient};

impl HttpExecutor for RestClient {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransferError>> {
        Box::pin(async move { Ok(self.send(request).await?) })
    }
}

impl RestClient {
    /// Sends `request`, streaming both bodies.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = match method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
        };
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Stream { stream, length } => {
                let builder = builder.body(reqwest::Body::wrap_stream(stream));
                match length {
                    Some(length) => builder.header(CONTENT_LENGTH, length.to_string()),
                    None => builder,
                }
            }
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        trace!(?method, %url, status, "response headers received");

        let body = resp.bytes_stream().map_err(io::Error::other);
        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
