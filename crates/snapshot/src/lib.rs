//! Snapshots of a character's appearance and the builder that keeps the
//! local player's snapshot current.
//!
//! A [`Snapshot`] maps every sub-object kind to the game paths its active
//! mods replace (by content hash, or by swapping in another game path), plus
//! the cosmetic override strings captured from the optional services. It is
//! content-addressed through its [`DataHash`].
//!
//! The [`SnapshotBuilder`] rebuilds one kind at a time and atomically swaps
//! the new fragment into the published snapshot.

mod builder;
mod change;
pub mod error;
mod model;
mod settings;

pub use crate::builder::{BuildOutcome, BuildState, SnapshotBuilder};
pub use crate::change::{Change, ChangeSet};
pub use crate::model::{DataHash, FileReplacement, Fragment, PlayerState, ReplacementTarget, Snapshot};
pub use crate::settings::SnapshotSettings;
