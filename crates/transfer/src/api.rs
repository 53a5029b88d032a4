//! The asset server contract.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// A streamed (LZ4-framed) response body.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One entry of the size/metadata query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSize {
    pub hash: String,
    /// Decompressed size in bytes.
    pub size: u64,
    /// Access to this file is denied. Never retried.
    #[serde(default)]
    pub forbidden: bool,
    /// Origin serving this file; the configured server when absent.
    #[serde(default)]
    pub url: Option<Url>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAuthorization {
    pub hash: String,
    #[serde(default)]
    pub forbidden: bool,
}

/// Produces the bearer token sent with every request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A token that never changes.
#[derive(Clone, Debug, Default)]
pub struct StaticToken(String);
impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Queued file transfer against one or more asset server origins.
///
/// Downloads go through a ticket: [`request`](Self::request) issues one,
/// [`queue_status`](Self::queue_status) reports when the server has the file
/// ready, [`stream`](Self::stream) delivers it and [`cancel`](Self::cancel)
/// drops it when the client loses interest.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// Origin for calls that are not tied to a file.
    fn base_url(&self) -> &Url;

    async fn sizes(&self, hashes: &[String]) -> Result<Vec<FileSize>>;

    /// Hint that these files will be requested soon.
    async fn enqueue(&self, origin: &Url, hashes: &[String]) -> Result<()>;

    async fn request(&self, origin: &Url, hash: &str) -> Result<Uuid>;

    /// `true` once the ticket's file can be streamed.
    async fn queue_status(&self, origin: &Url, request: Uuid) -> Result<bool>;

    async fn stream(&self, origin: &Url, request: Uuid) -> Result<ByteStream>;

    async fn cancel(&self, origin: &Url, request: Uuid) -> Result<()>;

    async fn upload_authorize(&self, hashes: &[String]) -> Result<Vec<UploadAuthorization>>;

    /// Upload an LZ4-framed file.
    async fn upload(&self, hash: &str, body: Bytes) -> Result<()>;
}
