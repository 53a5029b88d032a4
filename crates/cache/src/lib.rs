//! Hash-indexed, size-bounded content cache of mod asset files.
//!
//! Two roots are indexed:
//! - the **mod directory**: the user's installed mods. Read-only as far as
//!   this crate is concerned, never evicted.
//! - the **managed cache directory**: a flat directory of files downloaded
//!   from peers, named by their content hash, bounded in size by evicting
//!   the least recently accessed entries.
//!
//! The index lives in an in-memory map (for O(1) lookups) mirrored into a
//! SQLite database (so it survives restarts). The database is not the source
//! of truth, the files are: if it is deleted, a [`rescan`](ContentCache::rescan)
//! rebuilds it.
//!
//! Every mutation funnels through a single writer (the [`Repository`] behind
//! an async mutex) while reads only take a short-lived read lock.

mod db;
pub mod error;
mod hash;
mod models;
mod repo;
mod scan;
mod settings;
mod store;
mod watch;

pub use crate::db::Database;
pub use crate::hash::{hash_bytes, is_hash};
pub use crate::models::{ContentEntry, Root};
pub use crate::repo::Repository;
pub use crate::scan::{ScanOutcome, ScanReport};
pub use crate::settings::CacheSettings;
pub use crate::store::{CacheStats, ContentCache, EvictionReport, PinGuard};
pub use crate::watch::WatchHandle;
use std::sync::Arc;

pub type CacheHandle = Arc<ContentCache>;
