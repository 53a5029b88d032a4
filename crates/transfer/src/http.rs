//! [`TransferApi`] over HTTP.

use crate::api::{ByteStream, FileSize, TokenProvider, TransferApi, UploadAuthorization};
use crate::error::{ErrorKind, Result};
use crate::settings::TransferSettings;
use async_trait::async_trait;
use bytes::Bytes;
use exn::ResultExt;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Asset server client. Every request carries the provider's bearer token.
pub struct HttpTransferApi {
    client: Client,
    base: Url,
    tokens: Arc<dyn TokenProvider>,
    timeout: Duration,
}

impl HttpTransferApi {
    pub fn new(settings: &TransferSettings, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let base = Url::parse(&settings.server_url).or_raise(|| ErrorKind::Config(settings.server_url.clone()))?;
        // No overall client timeout: it would cut off long streamed bodies.
        let client = Client::builder()
            .connect_timeout(settings.request_timeout())
            .build()
            .or_raise(|| ErrorKind::Config("HTTP client".to_string()))?;
        Ok(Self { client, base, tokens, timeout: settings.request_timeout() })
    }

    fn endpoint(origin: &Url, route: &str) -> Result<Url> {
        origin.join(route).or_raise(|| ErrorKind::Config(format!("{origin}{route}")))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.tokens.token().await?;
        let request = if token.is_empty() { request } else { request.bearer_auth(token) };
        let response = request.send().await.or_raise(|| ErrorKind::Network)?;
        check_status(response)
    }

    async fn get(&self, origin: &Url, route: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = Self::endpoint(origin, route)?;
        self.send(self.client.get(url).query(query).timeout(self.timeout)).await
    }
}

fn check_status(response: Response) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => exn::bail!(ErrorKind::NotFound(response.url().path().to_string())),
        StatusCode::UNAUTHORIZED => exn::bail!(ErrorKind::Unauthorized),
        status => exn::bail!(ErrorKind::Status(status.as_u16())),
    }
}

#[async_trait]
impl TransferApi for HttpTransferApi {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn sizes(&self, hashes: &[String]) -> Result<Vec<FileSize>> {
        let response = self.get(&self.base, "/files/sizes", &[("hashes", hashes.join(","))]).await?;
        response.json().await.or_raise(|| ErrorKind::InvalidResponse)
    }

    async fn enqueue(&self, origin: &Url, hashes: &[String]) -> Result<()> {
        let url = Self::endpoint(origin, "/files/enqueue")?;
        self.send(self.client.post(url).json(hashes).timeout(self.timeout)).await?;
        Ok(())
    }

    async fn request(&self, origin: &Url, hash: &str) -> Result<Uuid> {
        let response = self.get(origin, "/files/request", &[("hash", hash.to_string())]).await?;
        response.json().await.or_raise(|| ErrorKind::InvalidResponse)
    }

    async fn queue_status(&self, origin: &Url, request: Uuid) -> Result<bool> {
        let response = self.get(origin, "/files/queue-status", &[("requestId", request.to_string())]).await?;
        response.json().await.or_raise(|| ErrorKind::InvalidResponse)
    }

    async fn stream(&self, origin: &Url, request: Uuid) -> Result<ByteStream> {
        let url = Self::endpoint(origin, "/files/stream")?;
        let response = self.send(self.client.get(url).query(&[("requestId", request.to_string())])).await?;
        Ok(response.bytes_stream().map(|chunk| chunk.or_raise(|| ErrorKind::Network)).boxed())
    }

    async fn cancel(&self, origin: &Url, request: Uuid) -> Result<()> {
        self.get(origin, "/files/cancel", &[("requestId", request.to_string())]).await?;
        Ok(())
    }

    async fn upload_authorize(&self, hashes: &[String]) -> Result<Vec<UploadAuthorization>> {
        let url = Self::endpoint(&self.base, "/files/upload-authorize")?;
        let response = self.send(self.client.post(url).json(hashes).timeout(self.timeout)).await?;
        response.json().await.or_raise(|| ErrorKind::InvalidResponse)
    }

    async fn upload(&self, hash: &str, body: Bytes) -> Result<()> {
        let url = Self::endpoint(&self.base, "/files/upload")?;
        let request = self
            .client
            .post(url)
            .query(&[("hash", hash)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.send(request).await?;
        Ok(())
    }
}
