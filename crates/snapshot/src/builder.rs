//! Incremental, per-kind snapshot building.

use crate::SnapshotSettings;
use crate::error::{ErrorKind, Result};
use crate::model::{DataHash, FileReplacement, Fragment, PlayerState, ReplacementTarget, Snapshot};
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use veneer_cache::CacheHandle;
use veneer_host::{
    CharacterRef, CosmeticSlot, Cosmetics, DrawState, GameObject, ModServiceHandle, ObjectKind, ObjectTableHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Game paths compare case-insensitively with forward slashes.
fn normalize(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    /// The host signalled a change; the next tick rebuilds.
    Dirty,
    Building,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The snapshot changed and was published.
    Published(DataHash),
    /// The rebuilt fragment was identical to the published one.
    Unchanged,
}

struct Slot {
    state: Mutex<BuildState>,
    /// Held for the duration of a build.
    running: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<CancellationToken>>,
}
impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(BuildState::Idle),
            running: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(None),
        }
    }
}

/// A pet file kept although the pet's current state no longer lists it.
#[derive(Clone, Debug)]
struct StickyEntry {
    hash: String,
    game_paths: BTreeSet<String>,
}

/// Files resolved in one build: resolved file path → (hash, game paths).
type ResolvedFiles = BTreeMap<String, (String, BTreeSet<String>)>;

/// Builds the snapshot of one character (normally the local player) from
/// the live objects the host reports.
pub struct SnapshotBuilder {
    owner: CharacterRef,
    objects: ObjectTableHandle,
    mods: ModServiceHandle,
    cosmetics: Cosmetics,
    cache: CacheHandle,
    settings: SnapshotSettings,
    slots: [Slot; 5],
    /// Keyed by resolved file path.
    sticky: Mutex<BTreeMap<String, StickyEntry>>,
    published: watch::Sender<Arc<Snapshot>>,
    shutdown: CancellationToken,
}

impl SnapshotBuilder {
    pub fn new(
        owner: CharacterRef,
        objects: ObjectTableHandle,
        mods: ModServiceHandle,
        cosmetics: Cosmetics,
        cache: CacheHandle,
        settings: SnapshotSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (published, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            owner,
            objects,
            mods,
            cosmetics,
            cache,
            settings,
            slots: std::array::from_fn(|_| Slot::new()),
            sticky: Mutex::new(BTreeMap::new()),
            published,
            shutdown,
        }
    }

    fn slot(&self, kind: ObjectKind) -> &Slot {
        &self.slots[kind as usize]
    }

    pub fn owner(&self) -> &CharacterRef {
        &self.owner
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.published.borrow().clone()
    }

    /// Observe every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.published.subscribe()
    }

    pub fn state(&self, kind: ObjectKind) -> BuildState {
        *lock(&self.slot(kind).state)
    }

    /// The host reported that the object's address or cosmetic state changed.
    pub fn mark_dirty(&self, kind: ObjectKind) {
        *lock(&self.slot(kind).state) = BuildState::Dirty;
    }

    /// Start a build for every dirty kind. Driven by the host's periodic
    /// tick.
    pub fn tick(self: &Arc<Self>) -> Vec<JoinHandle<Result<BuildOutcome>>> {
        ObjectKind::ALL
            .into_iter()
            .filter(|kind| self.state(*kind) == BuildState::Dirty)
            .map(|kind| self.request_build(kind))
            .collect()
    }

    /// Cancel any build in flight for `kind` and start a new one. The new
    /// build starts once the cancelled one has unwound.
    pub fn request_build(self: &Arc<Self>, kind: ObjectKind) -> JoinHandle<Result<BuildOutcome>> {
        let token = self.shutdown.child_token();
        if let Some(previous) = lock(&self.slot(kind).inflight).replace(token.clone()) {
            previous.cancel();
        }
        let builder = self.clone();
        tokio::spawn(async move { builder.build(kind, token).await })
    }

    /// Cancel every build and stop accepting new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run one build of `kind` to completion.
    ///
    /// On any error, cancellation included, the previously published
    /// fragment for `kind` is left untouched.
    #[instrument(skip(self, token), fields(owner = %self.owner, %kind))]
    pub async fn build(&self, kind: ObjectKind, token: CancellationToken) -> Result<BuildOutcome> {
        let slot = self.slot(kind);
        let _running = tokio::select! {
            _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            guard = slot.running.lock() => guard,
        };
        *lock(&slot.state) = BuildState::Building;
        let result = self.build_locked(kind, &token).await;
        {
            let mut state = lock(&slot.state);
            if *state == BuildState::Building {
                *state = BuildState::Idle;
            }
        }
        match &result {
            Ok(outcome) => tracing::debug!(?outcome, "Build finished"),
            Err(err) if err.is_cancellation() => tracing::debug!("Build cancelled"),
            Err(err) => tracing::warn!(error = %**err, "Build failed"),
        }
        result
    }

    async fn build_locked(&self, kind: ObjectKind, token: &CancellationToken) -> Result<BuildOutcome> {
        if !self.mods.is_available().await {
            exn::bail!(ErrorKind::ModServiceUnavailable);
        }
        let object = self.objects.resolve(&self.owner, kind).await;
        let game_paths = match &object {
            Some(object) => {
                self.wait_loaded(kind, object, token).await?;
                let paths = self.objects.game_paths(object).await.or_raise(|| ErrorKind::Host)?;
                paths.iter().map(|p| normalize(p)).collect()
            },
            None => {
                tracing::debug!("Object not present");
                BTreeSet::new()
            },
        };

        let (replacements, retained) = self.resolve(kind, game_paths, token).await?;
        let mut fragment = Fragment { replacements, ..Fragment::default() };
        if let Some(object) = &object {
            fragment.pose = self.cosmetic(CosmeticSlot::Pose, object).await;
            if kind == ObjectKind::Player {
                fragment.player = Some(PlayerState {
                    manipulation: self.mods.manipulation_data().await.or_raise(|| ErrorKind::Host)?,
                    skeleton_offset: self.cosmetic(CosmeticSlot::SkeletonOffset, object).await.unwrap_or_default(),
                    body_scale: self.cosmetic(CosmeticSlot::BodyScale, object).await.unwrap_or_default(),
                });
            }
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        if let Some(retained) = retained {
            *lock(&self.sticky) = retained;
        }
        self.publish(kind, fragment)
    }

    /// Poll until the object is past loading, bounded by the configured
    /// timeout.
    async fn wait_loaded(&self, kind: ObjectKind, object: &GameObject, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.settings.object_wait_timeout();
        loop {
            match self.objects.draw_state(object).await {
                None => exn::bail!(ErrorKind::ObjectGone(kind)),
                Some(DrawState::Loading) => {},
                Some(DrawState::Drawing | DrawState::Idle) => return Ok(()),
            }
            if Instant::now() >= deadline {
                exn::bail!(ErrorKind::NotLoaded(kind));
            }
            tokio::select! {
                _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                _ = tokio::time::sleep(self.settings.object_poll_interval()) => {},
            }
        }
    }

    /// Best-effort read of one cosmetic override.
    async fn cosmetic(&self, slot: CosmeticSlot, object: &GameObject) -> Option<String> {
        let service = self.cosmetics.available(slot).await?;
        match service.get(object).await {
            Ok(data) => data.filter(|d| !d.is_empty()),
            Err(err) => {
                tracing::warn!(%slot, error = %*err, "Could not read cosmetic override");
                None
            },
        }
    }

    fn uses_sticky(&self, kind: ObjectKind) -> bool {
        kind == ObjectKind::Pet && self.settings.sticky_pets
    }

    /// Resolve game paths through the mod service and turn the result into
    /// disjoint file replacements, along with the sticky entries to keep
    /// once the build is published.
    async fn resolve(
        &self,
        kind: ObjectKind,
        game_paths: BTreeSet<String>,
        token: &CancellationToken,
    ) -> Result<(BTreeSet<FileReplacement>, Option<BTreeMap<String, StickyEntry>>)> {
        let forward: Vec<String> = game_paths.into_iter().collect();
        let sticky = if self.uses_sticky(kind) { lock(&self.sticky).clone() } else { BTreeMap::new() };
        let reverse: Vec<String> = sticky.keys().cloned().collect();
        let resolved = self.mods.resolve_paths(&forward, &reverse).await.or_raise(|| ErrorKind::Host)?;
        if resolved.forward.len() != forward.len() || resolved.reverse.len() != reverse.len() {
            exn::bail!(ErrorKind::Host);
        }

        let mut files: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut swaps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (game_path, target) in forward.iter().zip(resolved.forward) {
            if normalize(&target) == *game_path {
                continue;
            }
            if Path::new(&target).is_absolute() {
                files.entry(target).or_default().insert(game_path.clone());
            } else {
                swaps.entry(normalize(&target)).or_default().insert(game_path.clone());
            }
        }

        let mut current = ResolvedFiles::new();
        for (file, paths) in files {
            if token.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            if let Some(hash) = self.hash_of(&file).await {
                current.insert(file, (hash, paths));
            }
        }

        // Every walked game path is currently resolved, so it wins over any
        // sticky entry claiming it.
        let mut claimed: BTreeSet<String> = forward.into_iter().collect();
        let mut by_hash: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (hash, paths) in current.values() {
            by_hash.entry(hash.clone()).or_default().extend(paths.iter().cloned());
        }

        let mut kept = None;
        if self.uses_sticky(kind) {
            let mut retained = BTreeMap::new();
            for ((file, entry), reverse) in sticky.into_iter().zip(resolved.reverse) {
                if current.contains_key(&file) {
                    continue;
                }
                if reverse.is_empty() {
                    tracing::debug!(%file, "Pruned sticky pet file");
                    continue;
                }
                let paths: BTreeSet<String> =
                    entry.game_paths.iter().filter(|p| !claimed.contains(*p)).cloned().collect();
                if paths.is_empty() {
                    continue;
                }
                claimed.extend(paths.iter().cloned());
                by_hash.entry(entry.hash.clone()).or_default().extend(paths.iter().cloned());
                retained.insert(file, StickyEntry { hash: entry.hash, game_paths: paths });
            }
            for (file, (hash, paths)) in &current {
                retained.insert(file.clone(), StickyEntry { hash: hash.clone(), game_paths: paths.clone() });
            }
            kept = Some(retained);
        }

        let mut replacements: BTreeSet<FileReplacement> = by_hash
            .into_iter()
            .map(|(hash, paths)| FileReplacement { game_paths: paths, target: ReplacementTarget::Hash(hash) })
            .collect();
        replacements.extend(
            swaps
                .into_iter()
                .map(|(target, paths)| FileReplacement { game_paths: paths, target: ReplacementTarget::Swap(target) }),
        );
        Ok((replacements, kept))
    }

    /// Content hash of a resolved mod file, ingesting it if the index does
    /// not know it yet. Files that cannot be hashed are dropped.
    async fn hash_of(&self, file: &str) -> Option<String> {
        if let Some(entry) = self.cache.entry_for_path(Path::new(file)) {
            return Some(entry.hash);
        }
        match self.cache.ingest(file).await {
            Ok(Some(entry)) => Some(entry.hash),
            Ok(None) => {
                tracing::warn!(file, "Mod file could not be hashed, skipping");
                None
            },
            Err(err) => {
                tracing::warn!(file, error = %*err, "Mod file could not be indexed, skipping");
                None
            },
        }
    }

    /// Swap the fragment into the published snapshot unless that changes
    /// nothing.
    fn publish(&self, kind: ObjectKind, fragment: Fragment) -> Result<BuildOutcome> {
        let mut published = None;
        self.published.send_if_modified(|current| {
            let next = current.with_fragment(kind, fragment);
            if next == **current {
                return false;
            }
            *current = Arc::new(next);
            published = Some(current.clone());
            true
        });
        match published {
            Some(snapshot) => {
                let hash = snapshot.data_hash()?;
                tracing::info!(%kind, data_hash = %hash, "Published snapshot");
                Ok(BuildOutcome::Published(hash))
            },
            None => Ok(BuildOutcome::Unchanged),
        }
    }
}
