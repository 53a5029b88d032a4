//! Appearance synchronization between paired peers.
//!
//! Each component lives in its own crate and is re-exported here:
//!
//! - [`cache`]: the local content-addressed store of mod files,
//! - [`snapshot`]: describing the local character's appearance,
//! - [`transfer`]: moving files between the asset server and the cache,
//! - [`apply`]: reproducing a peer's appearance on the character it is
//!   rendered as,
//! - [`host`]: the interfaces of the game-side services all of the above
//!   talk to.
//!
//! [`PeerSessionManager`] ties them together per peer.

pub mod error;
mod session;

pub use crate::session::{PeerId, PeerSessionManager, PeerStatus, Published, SyncReport, SyncTask};
pub use veneer_apply as apply;
pub use veneer_cache as cache;
pub use veneer_config as config;
pub use veneer_host as host;
pub use veneer_snapshot as snapshot;
pub use veneer_transfer as transfer;
