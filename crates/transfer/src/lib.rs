//! Content-addressed asset transfer through the asset server.
//!
//! Downloads are queued server-side: a ticket is requested per file, polled
//! until the server has the file ready, then streamed LZ4-framed into the
//! cache's partial directory and handed to [`ContentCache::store`] once it
//! is complete and verified. Uploads go the other way after the server has
//! authorized each hash.
//!
//! [`ContentCache::store`]: veneer_cache::ContentCache::store

mod api;
mod coordinator;
pub mod error;
mod forbidden;
mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod model;
mod settings;

pub use crate::api::{ByteStream, FileSize, StaticToken, TokenProvider, TransferApi, UploadAuthorization};
pub use crate::coordinator::{DownloadReport, TransferApiHandle, TransferCoordinator, UploadReport};
pub use crate::forbidden::ForbiddenRegistry;
pub use crate::http::HttpTransferApi;
pub use crate::model::{TransferRequest, TransferState, TransferTracker};
pub use crate::settings::TransferSettings;
