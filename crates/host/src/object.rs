//! Characters, their sub-objects and the host's object table.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// An independently tracked facet of one character's appearance.
///
/// The declaration order is the order sub-objects are applied in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Player,
    Minion,
    Mount,
    Pet,
    Companion,
}
impl ObjectKind {
    /// Every kind, in apply order.
    pub const ALL: [ObjectKind; 5] =
        [ObjectKind::Player, ObjectKind::Minion, ObjectKind::Mount, ObjectKind::Pet, ObjectKind::Companion];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Player => "player",
            ObjectKind::Minion => "minion",
            ObjectKind::Mount => "mount",
            ObjectKind::Pet => "pet",
            ObjectKind::Companion => "companion",
        }
    }

    /// Sub-objects that may legitimately be absent (not summoned, not
    /// mounted) without that being an error.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        !matches!(self, ObjectKind::Player)
    }
}
impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a character owner (the local player, or the
/// character a remote peer is rendered as).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacterRef(String);
impl CharacterRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Display for CharacterRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// Slot of an object in the host's object table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIndex(pub u16);
impl Display for ObjectIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}", self.0)
    }
}

/// A live object as resolved at one point in time.
///
/// Addresses are reused by the host once an object despawns, so a
/// `GameObject` must not be cached across operations; resolve it again
/// through [`ObjectTable::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GameObject {
    pub address: u64,
    pub index: ObjectIndex,
    pub kind: ObjectKind,
}

/// Render state of a live object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawState {
    /// Still streaming in its model/resources.
    Loading,
    /// Loaded, but a draw (or redraw) is in progress.
    Drawing,
    /// Loaded and quiescent; safe to mutate.
    Idle,
}

#[async_trait]
pub trait ObjectTable: Send + Sync {
    /// Resolve the live sub-object of `kind` belonging to `owner`, or `None`
    /// if it does not currently exist.
    async fn resolve(&self, owner: &CharacterRef, kind: ObjectKind) -> Option<GameObject>;

    /// Current render state, or `None` if the object at that address is gone
    /// (or the address now belongs to something else).
    async fn draw_state(&self, object: &GameObject) -> Option<DrawState>;

    /// Walk the object's render tree (skeleton, equipped slots, weapon
    /// children) and return every game path it references.
    async fn game_paths(&self, object: &GameObject) -> Result<Vec<String>>;
}
