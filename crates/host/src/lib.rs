//! Interfaces to the plugin host and the services reached through it.
//!
//! Nothing in this crate knows how the game works. It describes the three
//! collaborators the synchronization core talks to:
//!
//! - [`ObjectTable`]: finds live characters and their sub-objects, reports
//!   whether they are still loading or mid-draw, and walks their render
//!   tree for game paths.
//! - [`ModService`]: resolves game paths to mod files and manages temporary
//!   mod collections assigned to objects.
//! - [`CosmeticService`]: optional, independently versioned override
//!   services (skeleton offset, body scale, pose).
//!
//! Enable the `mock` feature for in-memory implementations that record every
//! mutating call into a shared [`mock::CallLog`].

pub mod cosmetic;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod mods;
pub mod object;

pub use crate::cosmetic::{ApiVersion, CosmeticService, CosmeticSlot, Cosmetics, PoseScope};
pub use crate::mods::{CollectionId, ModService, ResolvedPaths};
pub use crate::object::{CharacterRef, DrawState, GameObject, ObjectIndex, ObjectKind, ObjectTable};
use std::sync::Arc;

pub type ObjectTableHandle = Arc<dyn ObjectTable + Send + Sync>;
pub type ModServiceHandle = Arc<dyn ModService + Send + Sync>;
pub type CosmeticHandle = Arc<dyn CosmeticService + Send + Sync>;
