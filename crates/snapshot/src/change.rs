use crate::model::Snapshot;
use std::collections::{BTreeMap, BTreeSet};
use veneer_host::ObjectKind;

/// A category of state that can differ between two snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Change {
    ModFiles,
    Manipulation,
    SkeletonOffset,
    BodyScale,
    Pose,
}

/// Per-kind categories that differ between two snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeMap<ObjectKind, BTreeSet<Change>>);

impl ChangeSet {
    /// What has to be done to go from `previous` (nothing applied when
    /// `None`) to `next`.
    pub fn between(previous: Option<&Snapshot>, next: &Snapshot) -> Self {
        let empty = Snapshot::default();
        let previous = previous.unwrap_or(&empty);
        let mut changes: BTreeMap<ObjectKind, BTreeSet<Change>> = BTreeMap::new();
        let mut mark = |kind: ObjectKind, change: Change| {
            changes.entry(kind).or_default().insert(change);
        };
        for kind in ObjectKind::ALL {
            if previous.replacements.get(&kind) != next.replacements.get(&kind) {
                mark(kind, Change::ModFiles);
            }
            if previous.pose(kind) != next.pose(kind) {
                mark(kind, Change::Pose);
            }
        }
        if previous.manipulation != next.manipulation {
            mark(ObjectKind::Player, Change::Manipulation);
        }
        if previous.skeleton_offset != next.skeleton_offset {
            mark(ObjectKind::Player, Change::SkeletonOffset);
        }
        if previous.body_scale != next.body_scale {
            mark(ObjectKind::Player, Change::BodyScale);
        }
        Self(changes)
    }

    /// Every category of every kind present in `snapshot`; used to force a
    /// full re-apply.
    pub fn everything(snapshot: &Snapshot) -> Self {
        let all = BTreeSet::from([Change::ModFiles, Change::Manipulation, Change::SkeletonOffset, Change::BodyScale, Change::Pose]);
        let mut changes: BTreeMap<ObjectKind, BTreeSet<Change>> =
            snapshot.kinds().into_iter().map(|kind| (kind, BTreeSet::from([Change::ModFiles, Change::Pose]))).collect();
        changes.insert(ObjectKind::Player, all);
        Self(changes)
    }

    /// Adds every category of `kinds` as present in `snapshot`, for kinds
    /// an earlier apply left unfinished.
    pub fn redo(mut self, snapshot: &Snapshot, kinds: &BTreeSet<ObjectKind>) -> Self {
        for (kind, changes) in Self::everything(snapshot).0 {
            if kinds.contains(&kind) {
                self.0.entry(kind).or_default().extend(changes);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Kinds with at least one change, in apply order.
    pub fn kinds(&self) -> impl Iterator<Item = ObjectKind> + '_ {
        self.0.keys().copied()
    }

    pub fn get(&self, kind: ObjectKind) -> Option<&BTreeSet<Change>> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: ObjectKind, change: Change) -> bool {
        self.0.get(&kind).is_some_and(|changes| changes.contains(&change))
    }

    /// Whether the kind's remapped files or manipulation need re-registering.
    pub fn touches_mods(&self, kind: ObjectKind) -> bool {
        self.contains(kind, Change::ModFiles) || self.contains(kind, Change::Manipulation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileReplacement, Fragment, PlayerState, ReplacementTarget};

    fn with_file(path: &str, hash: char) -> Fragment {
        Fragment {
            replacements: BTreeSet::from([FileReplacement::new([path], ReplacementTarget::Hash(hash.to_string().repeat(40)))]),
            ..Fragment::default()
        }
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let snapshot = Snapshot::default().with_fragment(ObjectKind::Player, with_file("a", 'A'));
        assert!(ChangeSet::between(Some(&snapshot), &snapshot.clone()).is_empty());
    }

    #[test]
    fn test_first_apply_reports_present_state() {
        let snapshot = Snapshot::default().with_fragment(
            ObjectKind::Mount,
            Fragment { pose: Some("pose".into()), ..with_file("m", 'B') },
        );
        let changes = ChangeSet::between(None, &snapshot);
        assert_eq!(changes.kinds().collect::<Vec<_>>(), vec![ObjectKind::Mount]);
        assert!(changes.contains(ObjectKind::Mount, Change::ModFiles));
        assert!(changes.contains(ObjectKind::Mount, Change::Pose));
    }

    #[test]
    fn test_player_categories() {
        let before = Snapshot::default().with_fragment(
            ObjectKind::Player,
            Fragment { player: Some(PlayerState { manipulation: "m1".into(), ..PlayerState::default() }), ..Fragment::default() },
        );
        let after = before.with_fragment(
            ObjectKind::Player,
            Fragment {
                player: Some(PlayerState {
                    manipulation: "m1".into(),
                    body_scale: "scale".into(),
                    ..PlayerState::default()
                }),
                ..Fragment::default()
            },
        );
        let changes = ChangeSet::between(Some(&before), &after);
        assert_eq!(changes.get(ObjectKind::Player), Some(&BTreeSet::from([Change::BodyScale])));
        assert!(!changes.touches_mods(ObjectKind::Player));
    }

    #[test]
    fn test_removed_kind_is_a_change() {
        let before = Snapshot::default().with_fragment(ObjectKind::Pet, with_file("p", 'C'));
        let after = before.with_fragment(ObjectKind::Pet, Fragment::default());
        let changes = ChangeSet::between(Some(&before), &after);
        assert!(changes.contains(ObjectKind::Pet, Change::ModFiles));
    }

    #[test]
    fn test_redo_adds_only_the_given_kinds() {
        let snapshot = Snapshot::default()
            .with_fragment(ObjectKind::Player, with_file("p", 'A'))
            .with_fragment(ObjectKind::Pet, with_file("q", 'B'));
        let changes = ChangeSet::between(Some(&snapshot), &snapshot).redo(&snapshot, &BTreeSet::from([ObjectKind::Pet]));
        assert_eq!(changes.kinds().collect::<Vec<_>>(), vec![ObjectKind::Pet]);
        assert!(changes.touches_mods(ObjectKind::Pet));
    }

    #[test]
    fn test_kinds_in_apply_order() {
        let snapshot = Snapshot::default()
            .with_fragment(ObjectKind::Companion, with_file("c", 'A'))
            .with_fragment(ObjectKind::Minion, with_file("n", 'B'))
            .with_fragment(ObjectKind::Player, with_file("p", 'C'));
        let order: Vec<_> = ChangeSet::between(None, &snapshot).kinds().collect();
        assert_eq!(order, vec![ObjectKind::Player, ObjectKind::Minion, ObjectKind::Companion]);
    }
}
