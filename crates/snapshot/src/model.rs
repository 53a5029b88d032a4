//! The snapshot data model.
//!
//! Every collection is ordered so the JSON form, and with it the
//! [`DataHash`], is deterministic.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};
use veneer_host::ObjectKind;

/// What a set of game paths is replaced with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplacementTarget {
    /// A mod file, identified by its content hash.
    Hash(String),
    /// Another game path (a file swap).
    Swap(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReplacement {
    pub game_paths: BTreeSet<String>,
    pub target: ReplacementTarget,
}
impl FileReplacement {
    pub fn new(game_paths: impl IntoIterator<Item = impl Into<String>>, target: ReplacementTarget) -> Self {
        Self { game_paths: game_paths.into_iter().map(Into::into).collect(), target }
    }

    /// Whether the target differs from the identity path.
    pub fn has_replacement(&self) -> bool {
        match &self.target {
            ReplacementTarget::Hash(_) => true,
            ReplacementTarget::Swap(path) => !self.game_paths.contains(path),
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match &self.target {
            ReplacementTarget::Hash(hash) => Some(hash),
            ReplacementTarget::Swap(_) => None,
        }
    }
}

/// Change-detection identity of a snapshot: upper-case hex SHA-1 over its
/// JSON form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataHash(String);
impl DataHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Display for DataHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// Player-only state captured alongside the player's files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Opaque meta-manipulation data of the active mods.
    pub manipulation: String,
    /// Skeleton (heels) offset. Opaque text in the skeleton-offset
    /// service's own encoding, not a parsed float; applying passes it back
    /// unchanged. Empty when none.
    pub skeleton_offset: String,
    pub body_scale: String,
}

/// What one build of one object kind produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    pub replacements: BTreeSet<FileReplacement>,
    pub pose: Option<String>,
    /// Only set for [`ObjectKind::Player`].
    pub player: Option<PlayerState>,
}

/// One character's appearance at one point in time.
///
/// Immutable once published: builds produce a new snapshot through
/// [`with_fragment`](Self::with_fragment).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub replacements: BTreeMap<ObjectKind, BTreeSet<FileReplacement>>,
    /// Pose override strings per kind.
    pub cosmetic_overrides: BTreeMap<ObjectKind, String>,
    pub manipulation: String,
    /// Heels offset, opaque; see [`PlayerState::skeleton_offset`].
    pub skeleton_offset: String,
    pub body_scale: String,
}

impl Snapshot {
    pub fn data_hash(&self) -> Result<DataHash> {
        let json = serde_json::to_vec(self).or_raise(|| ErrorKind::Serialization)?;
        Ok(DataHash(hex::encode_upper(Sha1::digest(&json))))
    }

    /// A copy of this snapshot with `kind`'s part replaced by `fragment`.
    pub fn with_fragment(&self, kind: ObjectKind, fragment: Fragment) -> Snapshot {
        let mut next = self.clone();
        if fragment.replacements.is_empty() {
            next.replacements.remove(&kind);
        } else {
            next.replacements.insert(kind, fragment.replacements);
        }
        match fragment.pose.filter(|pose| !pose.is_empty()) {
            Some(pose) => {
                next.cosmetic_overrides.insert(kind, pose);
            },
            None => {
                next.cosmetic_overrides.remove(&kind);
            },
        }
        if kind == ObjectKind::Player {
            let player = fragment.player.unwrap_or_default();
            next.manipulation = player.manipulation;
            next.skeleton_offset = player.skeleton_offset;
            next.body_scale = player.body_scale;
        }
        next
    }

    pub fn replacements_for(&self, kind: ObjectKind) -> impl Iterator<Item = &FileReplacement> {
        self.replacements.get(&kind).into_iter().flatten()
    }

    /// Every content hash any kind references.
    pub fn required_hashes(&self) -> BTreeSet<String> {
        self.replacements.values().flatten().filter_map(|r| r.hash().map(str::to_string)).collect()
    }

    pub fn pose(&self, kind: ObjectKind) -> Option<&str> {
        self.cosmetic_overrides.get(&kind).map(String::as_str)
    }

    /// Kinds that carry any state.
    pub fn kinds(&self) -> BTreeSet<ObjectKind> {
        let mut kinds: BTreeSet<ObjectKind> = self.replacements.keys().copied().collect();
        kinds.extend(self.cosmetic_overrides.keys().copied());
        if !self.manipulation.is_empty() || !self.skeleton_offset.is_empty() || !self.body_scale.is_empty() {
            kinds.insert(ObjectKind::Player);
        }
        kinds
    }
}
