//! In-memory host for testing.
//!
//! Every mutating call made against the mocks is appended to a shared
//! [`CallLog`], so tests can assert on the exact order in which the object
//! table, the mod service and the cosmetic services were driven.

use crate::cosmetic::{ApiVersion, CosmeticService, CosmeticSlot, PoseScope};
use crate::error::{ErrorKind, Result};
use crate::mods::{CollectionId, ModService, ResolvedPaths};
use crate::object::{CharacterRef, DrawState, GameObject, ObjectIndex, ObjectKind, ObjectTable};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mutating call made against one of the mocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCall {
    CreateCollection(String),
    AssignCollection(CollectionId, ObjectIndex),
    SetTemporaryMods {
        collection: CollectionId,
        remap: BTreeMap<String, String>,
        manipulation: String,
    },
    RemoveCollection(CollectionId),
    Redraw(ObjectIndex),
    CosmeticSet {
        slot: CosmeticSlot,
        target: ObjectIndex,
        data: String,
        scope: PoseScope,
    },
    CosmeticRevert {
        slot: CosmeticSlot,
        target: ObjectIndex,
    },
}

/// Shared, append-only record of [`HostCall`]s.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<HostCall>>>);
impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: HostCall) {
        lock(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        lock(&self.0).clone()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }
}

// =========================================================================
// Object table
// =========================================================================

struct MockEntry {
    object: GameObject,
    states: VecDeque<DrawState>,
    paths: Vec<String>,
}

/// Object table holding spawned objects in a map.
///
/// Draw states can be scripted per object: each [`draw_state`](ObjectTable::draw_state)
/// call consumes one scripted state, the last one sticks. Unscripted objects
/// are always [`DrawState::Idle`].
pub struct MockObjectTable {
    objects: Mutex<HashMap<(CharacterRef, ObjectKind), MockEntry>>,
    next_address: AtomicU64,
}
impl Default for MockObjectTable {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(0x1000),
        }
    }
}
impl MockObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn (or respawn, at a new address) an object.
    pub fn spawn(
        &self,
        owner: &CharacterRef,
        kind: ObjectKind,
        index: u16,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> GameObject {
        let object = GameObject {
            address: self.next_address.fetch_add(0x10, Ordering::Relaxed),
            index: ObjectIndex(index),
            kind,
        };
        let entry = MockEntry {
            object,
            states: VecDeque::from([DrawState::Idle]),
            paths: paths.into_iter().map(Into::into).collect(),
        };
        lock(&self.objects).insert((owner.clone(), kind), entry);
        object
    }

    pub fn despawn(&self, owner: &CharacterRef, kind: ObjectKind) {
        lock(&self.objects).remove(&(owner.clone(), kind));
    }

    pub fn set_game_paths(&self, owner: &CharacterRef, kind: ObjectKind, paths: impl IntoIterator<Item = impl Into<String>>) {
        if let Some(entry) = lock(&self.objects).get_mut(&(owner.clone(), kind)) {
            entry.paths = paths.into_iter().map(Into::into).collect();
        }
    }

    pub fn script_draw_states(&self, owner: &CharacterRef, kind: ObjectKind, states: impl IntoIterator<Item = DrawState>) {
        if let Some(entry) = lock(&self.objects).get_mut(&(owner.clone(), kind)) {
            entry.states = states.into_iter().collect();
        }
    }
}

#[async_trait]
impl ObjectTable for MockObjectTable {
    async fn resolve(&self, owner: &CharacterRef, kind: ObjectKind) -> Option<GameObject> {
        lock(&self.objects).get(&(owner.clone(), kind)).map(|e| e.object)
    }

    async fn draw_state(&self, object: &GameObject) -> Option<DrawState> {
        let mut objects = lock(&self.objects);
        let entry = objects.values_mut().find(|e| e.object.address == object.address)?;
        let state = match entry.states.len() {
            0 => DrawState::Idle,
            1 => entry.states[0],
            _ => entry.states.pop_front().unwrap_or(DrawState::Idle),
        };
        Some(state)
    }

    async fn game_paths(&self, object: &GameObject) -> Result<Vec<String>> {
        let objects = lock(&self.objects);
        match objects.values().find(|e| e.object.address == object.address) {
            Some(entry) => Ok(entry.paths.clone()),
            None => exn::bail!(ErrorKind::ObjectGone),
        }
    }
}

// =========================================================================
// Mod service
// =========================================================================

/// State of a temporary collection held by [`MockModService`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockCollection {
    pub name: String,
    pub assigned: Vec<ObjectIndex>,
    pub remap: BTreeMap<String, String>,
    pub manipulation: String,
}

/// Mod service resolving paths from a redirect table.
///
/// Game paths without a redirect resolve to themselves. Redraws complete
/// immediately (an event is broadcast from inside [`ModService::redraw`])
/// unless disabled with [`set_redraw_events`](Self::set_redraw_events).
pub struct MockModService {
    available: AtomicBool,
    emit_redraw_events: AtomicBool,
    redirects: Mutex<BTreeMap<String, String>>,
    manipulation: Mutex<String>,
    collections: Mutex<BTreeMap<CollectionId, MockCollection>>,
    events: broadcast::Sender<ObjectIndex>,
    log: CallLog,
}
impl MockModService {
    pub fn new(log: CallLog) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            available: AtomicBool::new(true),
            emit_redraw_events: AtomicBool::new(true),
            redirects: Mutex::new(BTreeMap::new()),
            manipulation: Mutex::new(String::new()),
            collections: Mutex::new(BTreeMap::new()),
            events,
            log,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_redraw_events(&self, emit: bool) {
        self.emit_redraw_events.store(emit, Ordering::SeqCst);
    }

    pub fn redirect(&self, game_path: impl Into<String>, resolved: impl Into<String>) {
        lock(&self.redirects).insert(game_path.into(), resolved.into());
    }

    pub fn clear_redirect(&self, game_path: &str) {
        lock(&self.redirects).remove(game_path);
    }

    pub fn set_manipulation(&self, data: impl Into<String>) {
        *lock(&self.manipulation) = data.into();
    }

    /// Collections that have been created and not yet removed.
    pub fn collections(&self) -> BTreeMap<CollectionId, MockCollection> {
        lock(&self.collections).clone()
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

#[async_trait]
impl ModService for MockModService {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn resolve_paths(&self, forward: &[String], reverse: &[String]) -> Result<ResolvedPaths> {
        if !self.available.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Unavailable("mock mod service".to_string()));
        }
        let redirects = lock(&self.redirects);
        let forward = forward.iter().map(|p| redirects.get(p).cloned().unwrap_or_else(|| p.clone())).collect();
        let reverse = reverse
            .iter()
            .map(|file| redirects.iter().filter(|(_, to)| *to == file).map(|(from, _)| from.clone()).collect())
            .collect();
        Ok(ResolvedPaths { forward, reverse })
    }

    async fn manipulation_data(&self) -> Result<String> {
        Ok(lock(&self.manipulation).clone())
    }

    async fn create_temporary_collection(&self, name: &str) -> Result<CollectionId> {
        let id = CollectionId(Uuid::new_v4());
        lock(&self.collections).insert(id, MockCollection { name: name.to_string(), ..Default::default() });
        self.log.push(HostCall::CreateCollection(name.to_string()));
        Ok(id)
    }

    async fn assign_collection(&self, collection: CollectionId, target: ObjectIndex) -> Result<()> {
        let mut collections = lock(&self.collections);
        let Some(state) = collections.get_mut(&collection) else {
            exn::bail!(ErrorKind::Call(format!("unknown collection {collection}")));
        };
        state.assigned.push(target);
        self.log.push(HostCall::AssignCollection(collection, target));
        Ok(())
    }

    async fn set_temporary_mods(
        &self,
        collection: CollectionId,
        remap: &BTreeMap<String, String>,
        manipulation: &str,
    ) -> Result<()> {
        let mut collections = lock(&self.collections);
        let Some(state) = collections.get_mut(&collection) else {
            exn::bail!(ErrorKind::Call(format!("unknown collection {collection}")));
        };
        state.remap = remap.clone();
        state.manipulation = manipulation.to_string();
        self.log.push(HostCall::SetTemporaryMods {
            collection,
            remap: remap.clone(),
            manipulation: manipulation.to_string(),
        });
        Ok(())
    }

    async fn remove_collection(&self, collection: CollectionId) -> Result<()> {
        if lock(&self.collections).remove(&collection).is_none() {
            exn::bail!(ErrorKind::Call(format!("unknown collection {collection}")));
        }
        self.log.push(HostCall::RemoveCollection(collection));
        Ok(())
    }

    async fn redraw(&self, target: ObjectIndex) -> Result<()> {
        self.log.push(HostCall::Redraw(target));
        if self.emit_redraw_events.load(Ordering::SeqCst) {
            // No receivers is fine: nobody is waiting on this redraw.
            _ = self.events.send(target);
        }
        Ok(())
    }

    fn redraw_events(&self) -> broadcast::Receiver<ObjectIndex> {
        self.events.subscribe()
    }
}

// =========================================================================
// Cosmetic services
// =========================================================================

/// Cosmetic service storing override data per object index.
pub struct MockCosmetic {
    slot: CosmeticSlot,
    version: Mutex<Option<ApiVersion>>,
    data: Mutex<HashMap<ObjectIndex, String>>,
    log: CallLog,
}
impl MockCosmetic {
    pub fn new(slot: CosmeticSlot, version: ApiVersion, log: CallLog) -> Self {
        Self {
            slot,
            version: Mutex::new(Some(version)),
            data: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Simulate the plugin being unloaded (`None`) or updated.
    pub fn set_version(&self, version: Option<ApiVersion>) {
        *lock(&self.version) = version;
    }

    pub fn set_data(&self, target: ObjectIndex, data: impl Into<String>) {
        lock(&self.data).insert(target, data.into());
    }

    pub fn data(&self, target: ObjectIndex) -> Option<String> {
        lock(&self.data).get(&target).cloned()
    }
}

#[async_trait]
impl CosmeticService for MockCosmetic {
    fn slot(&self) -> CosmeticSlot {
        self.slot
    }

    async fn version(&self) -> Option<ApiVersion> {
        *lock(&self.version)
    }

    async fn get(&self, object: &GameObject) -> Result<Option<String>> {
        Ok(lock(&self.data).get(&object.index).cloned())
    }

    async fn set(&self, object: &GameObject, data: &str, scope: PoseScope) -> Result<()> {
        lock(&self.data).insert(object.index, data.to_string());
        self.log.push(HostCall::CosmeticSet {
            slot: self.slot,
            target: object.index,
            data: data.to_string(),
            scope,
        });
        Ok(())
    }

    async fn revert(&self, object: &GameObject) -> Result<()> {
        lock(&self.data).remove(&object.index);
        self.log.push(HostCall::CosmeticRevert { slot: self.slot, target: object.index });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_forward_and_reverse() {
        let mods = MockModService::new(CallLog::new());
        mods.redirect("chara/a.tex", "/mods/a.tex");
        mods.redirect("chara/b.tex", "/mods/a.tex");
        let forward = vec!["chara/a.tex".to_string(), "chara/c.tex".to_string()];
        let reverse = vec!["/mods/a.tex".to_string(), "/mods/gone.tex".to_string()];
        let resolved = mods.resolve_paths(&forward, &reverse).await.unwrap();
        assert_eq!(resolved.forward, vec!["/mods/a.tex", "chara/c.tex"]);
        assert_eq!(resolved.reverse[0], vec!["chara/a.tex", "chara/b.tex"]);
        assert!(resolved.reverse[1].is_empty());
    }

    #[tokio::test]
    async fn test_draw_state_script() {
        let table = MockObjectTable::new();
        let owner = CharacterRef::new("owner");
        let object = table.spawn(&owner, ObjectKind::Player, 0, ["chara/a.mdl"]);
        table.script_draw_states(&owner, ObjectKind::Player, [DrawState::Loading, DrawState::Idle]);
        assert_eq!(table.draw_state(&object).await, Some(DrawState::Loading));
        assert_eq!(table.draw_state(&object).await, Some(DrawState::Idle));
        assert_eq!(table.draw_state(&object).await, Some(DrawState::Idle));
        // A respawn moves the object, the stale handle is gone.
        table.spawn(&owner, ObjectKind::Player, 0, ["chara/a.mdl"]);
        assert_eq!(table.draw_state(&object).await, None);
    }
}
