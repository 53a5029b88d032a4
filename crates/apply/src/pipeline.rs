//! Applying received snapshots to live characters, and undoing it.

use crate::error::{ErrorKind, Result};
use crate::remap::{self, RemapTable};
use crate::settings::ApplySettings;
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;
use veneer_cache::CacheHandle;
use veneer_host::{
    CharacterRef, CollectionId, CosmeticSlot, Cosmetics, DrawState, GameObject, ModServiceHandle, ObjectKind,
    ObjectTableHandle, PoseScope,
};
use veneer_snapshot::{Change, ChangeSet, DataHash, Snapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyReport {
    pub data_hash: DataHash,
    /// Kinds whose every step ran.
    pub applied: BTreeSet<ObjectKind>,
    /// Kinds with changes whose object does not exist (pet not summoned,
    /// not mounted). Nothing was done for them.
    pub absent: BTreeSet<ObjectKind>,
    /// Kinds whose object despawned part-way through.
    pub gone: BTreeSet<ObjectKind>,
    pub failed: BTreeSet<ObjectKind>,
    /// Hashes left out of the remap tables because they are not cached.
    pub missing: BTreeSet<String>,
    /// Kinds applied without some of their files.
    pub partial: BTreeSet<ObjectKind>,
    /// The remap table registered for each kind whose mod files changed.
    pub remap: BTreeMap<ObjectKind, BTreeMap<String, String>>,
}
impl ApplyReport {
    fn new(data_hash: DataHash) -> Self {
        Self {
            data_hash,
            applied: BTreeSet::new(),
            absent: BTreeSet::new(),
            gone: BTreeSet::new(),
            failed: BTreeSet::new(),
            missing: BTreeSet::new(),
            partial: BTreeSet::new(),
            remap: BTreeMap::new(),
        }
    }

    /// Whether the target now looks exactly like the snapshot.
    pub fn is_complete(&self) -> bool {
        self.outstanding().is_empty()
    }

    /// Kinds that still need work to match the snapshot.
    pub fn outstanding(&self) -> BTreeSet<ObjectKind> {
        let mut kinds = self.partial.clone();
        kinds.extend(&self.absent);
        kinds.extend(&self.gone);
        kinds.extend(&self.failed);
        kinds
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyReport),
    /// Same data hash as the last apply, which left nothing outstanding;
    /// nothing was touched.
    Unchanged,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevertReport {
    pub reverted: BTreeSet<ObjectKind>,
    /// Temporary collections that were still held and got removed.
    pub released: usize,
    /// Host calls that failed. Revert carries on past them.
    pub failures: usize,
}

/// What has been done to a target, recorded before each mutation so revert
/// can undo a partial apply.
#[derive(Debug, Default)]
struct Applied {
    /// The last apply that ran to the end.
    last: Option<(DataHash, Arc<Snapshot>)>,
    /// Kinds `last` left unfinished. The next apply redoes them.
    outstanding: BTreeSet<ObjectKind>,
    cosmetics: BTreeSet<(ObjectKind, CosmeticSlot)>,
    modded: BTreeSet<ObjectKind>,
    /// Collections created and not yet removed.
    held: BTreeSet<CollectionId>,
}

struct Target {
    /// Held for the duration of an apply or revert.
    running: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<CancellationToken>>,
    applied: Mutex<Applied>,
}
impl Target {
    fn new() -> Self {
        Self {
            running: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(None),
            applied: Mutex::new(Applied::default()),
        }
    }
}

/// Mutates the characters remote peers are rendered as so they match the
/// snapshots those peers send.
///
/// Applies to one target are serialized: a new apply cancels the one in
/// flight and starts once it has unwound. Applies to different targets run
/// concurrently.
pub struct ApplyPipeline {
    objects: ObjectTableHandle,
    mods: ModServiceHandle,
    cosmetics: Cosmetics,
    cache: CacheHandle,
    settings: ApplySettings,
    targets: Mutex<HashMap<CharacterRef, Arc<Target>>>,
}

impl ApplyPipeline {
    pub fn new(
        objects: ObjectTableHandle,
        mods: ModServiceHandle,
        cosmetics: Cosmetics,
        cache: CacheHandle,
        settings: ApplySettings,
    ) -> Self {
        Self { objects, mods, cosmetics, cache, settings, targets: Mutex::new(HashMap::new()) }
    }

    fn target(&self, owner: &CharacterRef) -> Arc<Target> {
        lock(&self.targets).entry(owner.clone()).or_insert_with(|| Arc::new(Target::new())).clone()
    }

    /// Data hash of the snapshot `owner` fully matches.
    pub fn applied_hash(&self, owner: &CharacterRef) -> Option<DataHash> {
        let target = lock(&self.targets).get(owner)?.clone();
        let applied = lock(&target.applied);
        if !applied.outstanding.is_empty() {
            return None;
        }
        applied.last.as_ref().map(|(hash, _)| hash.clone())
    }

    pub fn is_applying(&self, owner: &CharacterRef) -> bool {
        let Some(target) = lock(&self.targets).get(owner).cloned() else {
            return false;
        };
        target.running.try_lock().is_err()
    }

    /// Cancel the apply in flight for `owner`, if any, without waiting for it.
    pub fn cancel(&self, owner: &CharacterRef) {
        if let Some(target) = lock(&self.targets).get(owner)
            && let Some(token) = lock(&target.inflight).take()
        {
            token.cancel();
        }
    }

    /// Make `owner`'s character look like `snapshot`.
    ///
    /// Only the kinds that differ from the last apply, or that it left
    /// outstanding, are touched; `force` re-applies everything. An error means nothing could be
    /// applied at all (mod service down) or the apply was cancelled; per-kind
    /// problems end up in the [`ApplyReport`].
    #[instrument(skip(self, snapshot, token), fields(owner = %owner))]
    pub async fn apply(
        &self,
        owner: &CharacterRef,
        snapshot: Arc<Snapshot>,
        force: bool,
        token: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let target = self.target(owner);
        let token = token.child_token();
        if let Some(previous) = lock(&target.inflight).replace(token.clone()) {
            previous.cancel();
        }
        let _running = tokio::select! {
            _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            guard = target.running.lock() => guard,
        };
        let result = self.apply_locked(owner, &target, snapshot, force, &token).await;
        match &result {
            Ok(ApplyOutcome::Applied(report)) => tracing::info!(
                hash = %report.data_hash,
                applied = report.applied.len(),
                absent = report.absent.len(),
                missing = report.missing.len(),
                "Applied snapshot"
            ),
            Ok(ApplyOutcome::Unchanged) => tracing::debug!("Snapshot already applied"),
            Err(err) if err.is_cancellation() => tracing::debug!("Apply cancelled"),
            Err(err) => tracing::warn!(error = %**err, "Apply failed"),
        }
        result
    }

    async fn apply_locked(
        &self,
        owner: &CharacterRef,
        target: &Target,
        snapshot: Arc<Snapshot>,
        force: bool,
        token: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let data_hash = snapshot.data_hash().or_raise(|| ErrorKind::Snapshot)?;
        let (last, outstanding) = {
            let applied = lock(&target.applied);
            (applied.last.clone(), applied.outstanding.clone())
        };
        let changes = match &last {
            _ if force => ChangeSet::everything(&snapshot),
            Some((hash, _)) if *hash == data_hash && outstanding.is_empty() => return Ok(ApplyOutcome::Unchanged),
            Some((hash, _)) if *hash == data_hash => ChangeSet::default().redo(&snapshot, &outstanding),
            Some((_, previous)) => ChangeSet::between(Some(&**previous), &snapshot).redo(&snapshot, &outstanding),
            None => ChangeSet::between(None, &snapshot),
        };
        if !self.mods.is_available().await {
            exn::bail!(ErrorKind::ModServiceUnavailable);
        }

        let mut report = ApplyReport::new(data_hash.clone());
        for kind in changes.kinds() {
            if token.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            // Never reuse an address from an earlier apply: it may belong to
            // another object by now.
            let Some(object) = self.objects.resolve(owner, kind).await else {
                tracing::debug!(%kind, "Target object not present, skipping");
                report.absent.insert(kind);
                continue;
            };
            match self.apply_kind(owner, target, &snapshot, &changes, &object, &mut report, token).await {
                Ok(()) => {
                    report.applied.insert(kind);
                },
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if matches!(*err, ErrorKind::ObjectGone(_)) => {
                    tracing::warn!(%kind, "Target object disappeared during apply");
                    report.gone.insert(kind);
                },
                Err(err) => {
                    tracing::warn!(%kind, error = %*err, "Applying to target object failed");
                    report.failed.insert(kind);
                },
            }
        }
        {
            let mut applied = lock(&target.applied);
            applied.outstanding = report.outstanding();
            applied.last = Some((data_hash, snapshot));
        }
        Ok(ApplyOutcome::Applied(report))
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip_all, fields(kind = %object.kind, index = %object.index))]
    async fn apply_kind(
        &self,
        owner: &CharacterRef,
        target: &Target,
        snapshot: &Snapshot,
        changes: &ChangeSet,
        object: &GameObject,
        report: &mut ApplyReport,
        token: &CancellationToken,
    ) -> Result<()> {
        let kind = object.kind;
        let hashes = snapshot.replacements_for(kind).filter_map(|r| r.hash().map(str::to_string));
        let _pinned = self.cache.pin(hashes);

        let mut registration = None;
        let mut collection = None;
        if changes.touches_mods(kind) {
            let table = remap::resolve(&self.cache, snapshot.replacements_for(kind)).await?;
            if !table.missing.is_empty() {
                tracing::warn!(%kind, missing = table.missing.len(), "Some files are not available locally");
                report.partial.insert(kind);
            }
            report.missing.extend(table.missing.iter().cloned());
            let manipulation = if kind == ObjectKind::Player { snapshot.manipulation.as_str() } else { "" };
            if !table.is_empty() || !manipulation.is_empty() {
                let name = format!("veneer_{owner}_{kind}_{}", Uuid::new_v4().simple());
                let id = self.mods.create_temporary_collection(&name).await.or_raise(|| ErrorKind::Host)?;
                lock(&target.applied).held.insert(id);
                collection = Some(id);
            }
            report.remap.insert(kind, table.entries.clone());
            registration = Some((table, manipulation));
        }

        let result = self.run_steps(target, snapshot, changes, object, collection.zip(registration.as_ref()), token).await;
        if let Some(collection) = collection {
            self.release(target, collection).await;
        }
        result
    }

    /// Everything between creating the temporary collection and releasing
    /// it.
    async fn run_steps(
        &self,
        target: &Target,
        snapshot: &Snapshot,
        changes: &ChangeSet,
        object: &GameObject,
        collection: Option<(CollectionId, &(RemapTable, &str))>,
        token: &CancellationToken,
    ) -> Result<()> {
        let kind = object.kind;
        if changes.touches_mods(kind) {
            lock(&target.applied).modded.insert(kind);
        }
        if let Some((collection, (remap, manipulation))) = collection {
            self.mods.assign_collection(collection, object.index).await.or_raise(|| ErrorKind::Host)?;
            self.mods
                .set_temporary_mods(collection, &remap.entries, manipulation)
                .await
                .or_raise(|| ErrorKind::Host)?;
        }
        self.wait_idle(object, token).await?;
        self.apply_cosmetics(target, snapshot, changes, object).await?;
        if changes.touches_mods(kind) {
            self.redraw(object, token).await?;
            self.wait_idle(object, token).await?;
        }
        Ok(())
    }

    /// Skeleton offset, then body scale, then pose.
    async fn apply_cosmetics(
        &self,
        target: &Target,
        snapshot: &Snapshot,
        changes: &ChangeSet,
        object: &GameObject,
    ) -> Result<()> {
        let kind = object.kind;
        let mut steps: Vec<(CosmeticSlot, &str, PoseScope)> = Vec::new();
        if kind == ObjectKind::Player {
            if changes.contains(kind, Change::SkeletonOffset) {
                steps.push((CosmeticSlot::SkeletonOffset, &snapshot.skeleton_offset, PoseScope::Full));
            }
            if changes.contains(kind, Change::BodyScale) {
                steps.push((CosmeticSlot::BodyScale, &snapshot.body_scale, PoseScope::Full));
            }
        }
        let pose = snapshot.pose(kind).unwrap_or_default();
        if changes.contains(kind, Change::Pose) {
            steps.push((CosmeticSlot::Pose, pose, PoseScope::Full));
        } else if changes.contains(kind, Change::ModFiles) && !pose.is_empty() {
            steps.push((CosmeticSlot::Pose, pose, PoseScope::EquipmentOnly));
        }

        for (slot, data, scope) in steps {
            let Some(service) = self.cosmetics.available(slot).await else {
                tracing::debug!(%slot, "Cosmetic service not available, skipping");
                continue;
            };
            lock(&target.applied).cosmetics.insert((kind, slot));
            let call = if data.is_empty() { service.revert(object).await } else { service.set(object, data, scope).await };
            call.or_raise(|| ErrorKind::Host)?;
        }
        Ok(())
    }

    /// Wait for the object to stop loading or drawing.
    ///
    /// Past the poll timeout this keeps waiting, up to the hard cap, and
    /// then proceeds regardless.
    async fn wait_idle(&self, object: &GameObject, token: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let mut slow = false;
        loop {
            let state = match self.objects.draw_state(object).await {
                None => exn::bail!(ErrorKind::ObjectGone(object.kind)),
                Some(DrawState::Idle) => return Ok(()),
                Some(state) => state,
            };
            let waited = started.elapsed();
            if waited >= self.settings.draw_hard_cap() {
                tracing::warn!(kind = %object.kind, ?state, "Target still busy at the hard cap, continuing anyway");
                return Ok(());
            }
            if !slow && waited >= self.settings.draw_poll_timeout() {
                slow = true;
                tracing::debug!(kind = %object.kind, ?state, "Target still busy, waiting up to the hard cap");
            }
            tokio::select! {
                _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                _ = tokio::time::sleep(self.settings.draw_poll_interval()) => {},
            }
        }
    }

    /// Redraw the object and wait for the host to report the redraw done.
    async fn redraw(&self, object: &GameObject, token: &CancellationToken) -> Result<()> {
        let mut events = self.mods.redraw_events();
        self.mods.redraw(object.index).await.or_raise(|| ErrorKind::Host)?;
        let finished = async {
            loop {
                match events.recv().await {
                    Ok(index) if index == object.index => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => {},
                    Err(RecvError::Closed) => return false,
                }
            }
        };
        let finished = tokio::select! {
            _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            finished = tokio::time::timeout(self.settings.redraw_timeout(), finished) => finished,
        };
        match finished {
            Ok(true) => tracing::debug!(index = %object.index, "Redraw finished"),
            Ok(false) => tracing::debug!("Redraw notifications closed"),
            Err(_) => tracing::warn!(index = %object.index, "No redraw notification in time, continuing"),
        }
        Ok(())
    }

    async fn release(&self, target: &Target, collection: CollectionId) -> bool {
        match self.mods.remove_collection(collection).await {
            Ok(()) => {
                lock(&target.applied).held.remove(&collection);
                true
            },
            Err(err) => {
                tracing::warn!(%collection, error = %*err, "Releasing temporary collection failed");
                false
            },
        }
    }

    /// Undo everything applied to `owner`, including whatever a cancelled or
    /// failed apply got to do before it stopped.
    ///
    /// Cosmetic overrides are reverted first, then any collection still held
    /// is removed and the affected objects are redrawn. Failures are logged
    /// and counted, never returned.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn revert(&self, owner: &CharacterRef) -> RevertReport {
        let mut report = RevertReport::default();
        let Some(target) = lock(&self.targets).get(owner).cloned() else {
            return report;
        };
        if let Some(token) = lock(&target.inflight).take() {
            token.cancel();
        }
        let _running = target.running.lock().await;
        let applied = std::mem::take(&mut *lock(&target.applied));

        let mut kinds: BTreeSet<ObjectKind> = applied.cosmetics.iter().map(|(kind, _)| *kind).collect();
        kinds.extend(applied.modded.iter().copied());
        let mut objects = BTreeMap::new();
        for kind in kinds {
            match self.objects.resolve(owner, kind).await {
                Some(object) => {
                    objects.insert(kind, object);
                },
                None => tracing::debug!(%kind, "Target object gone, nothing to revert"),
            }
        }

        for (kind, object) in &objects {
            for slot in [CosmeticSlot::Pose, CosmeticSlot::BodyScale, CosmeticSlot::SkeletonOffset] {
                if !applied.cosmetics.contains(&(*kind, slot)) {
                    continue;
                }
                let Some(service) = self.cosmetics.available(slot).await else {
                    continue;
                };
                if let Err(err) = service.revert(object).await {
                    tracing::warn!(%kind, %slot, error = %*err, "Reverting cosmetic override failed");
                    report.failures += 1;
                }
            }
            report.reverted.insert(*kind);
        }
        for collection in applied.held {
            match self.mods.remove_collection(collection).await {
                Ok(()) => report.released += 1,
                Err(err) => {
                    tracing::warn!(%collection, error = %*err, "Removing temporary collection failed");
                    report.failures += 1;
                },
            }
        }
        for (kind, object) in &objects {
            if !applied.modded.contains(kind) {
                continue;
            }
            if let Err(err) = self.mods.redraw(object.index).await {
                tracing::warn!(%kind, error = %*err, "Redraw after revert failed");
                report.failures += 1;
            }
        }
        tracing::info!(reverted = report.reverted.len(), failures = report.failures, "Reverted target");
        report
    }

    /// Revert every target this pipeline has touched.
    pub async fn revert_all(&self) -> Vec<(CharacterRef, RevertReport)> {
        let owners: Vec<CharacterRef> = lock(&self.targets).keys().cloned().collect();
        let mut reports = Vec::with_capacity(owners.len());
        for owner in owners {
            let report = self.revert(&owner).await;
            reports.push((owner, report));
        }
        reports
    }
}
