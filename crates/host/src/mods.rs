//! The mod-application service.

use crate::error::Result;
use crate::object::ObjectIndex;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Handle to a temporary mod collection created through the mod service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(pub Uuid);
impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// Result of a batched path resolution.
///
/// `forward[i]` is the file (or game path) that `forward` input `i` resolves
/// to; `reverse[i]` lists every game path that currently resolves to
/// `reverse` input `i` (empty when nothing does any more).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub forward: Vec<String>,
    pub reverse: Vec<Vec<String>>,
}

#[async_trait]
pub trait ModService: Send + Sync {
    /// Whether the service is connected and its API usable.
    async fn is_available(&self) -> bool;

    /// Resolve game paths forwards (game path → file) and file paths in
    /// reverse (file → game paths), for the local player's active mods.
    async fn resolve_paths(&self, forward: &[String], reverse: &[String]) -> Result<ResolvedPaths>;

    /// Opaque meta-manipulation data of the local player's active mods.
    async fn manipulation_data(&self) -> Result<String>;

    async fn create_temporary_collection(&self, name: &str) -> Result<CollectionId>;

    async fn assign_collection(&self, collection: CollectionId, target: ObjectIndex) -> Result<()>;

    /// Register `remap` (game path → file path or game path) and the
    /// manipulation blob as the collection's temporary mod.
    async fn set_temporary_mods(
        &self,
        collection: CollectionId,
        remap: &BTreeMap<String, String>,
        manipulation: &str,
    ) -> Result<()>;

    async fn remove_collection(&self, collection: CollectionId) -> Result<()>;

    /// Ask the host to redraw the object; completion is signalled through
    /// [`redraw_events`](Self::redraw_events).
    async fn redraw(&self, target: ObjectIndex) -> Result<()>;

    /// Subscribe to "redraw finished" notifications.
    fn redraw_events(&self) -> broadcast::Receiver<ObjectIndex>;
}
