//! Per-file transfer state shared with whoever owns the transfer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use url::Url;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Waiting for the server to prepare the file.
    Queued,
    Ready,
    Streaming,
    Done,
    /// Access denied. Terminal and never retried.
    Forbidden,
    /// Gave up after the permitted retries (or on a permanent error).
    Failed,
}
impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Forbidden | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub hash: String,
    pub source: Option<Url>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub state: TransferState,
    /// The server's queue ticket, once issued.
    pub request_id: Option<Uuid>,
}
impl TransferRequest {
    pub fn new(hash: impl Into<String>, source: Option<Url>, total_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            source,
            total_bytes,
            transferred_bytes: 0,
            state: TransferState::Queued,
            request_id: None,
        }
    }
}

/// Progress of every transfer started on behalf of one owner (a peer
/// session). Cheap to clone; clones share state.
#[derive(Clone, Debug, Default)]
pub struct TransferTracker(Arc<Mutex<BTreeMap<String, TransferRequest>>>);

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TransferRequest>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, request: TransferRequest) {
        self.lock().insert(request.hash.clone(), request);
    }

    /// Apply `change` to the request for `hash`, if one is tracked.
    pub fn update(&self, hash: &str, change: impl FnOnce(&mut TransferRequest)) {
        if let Some(request) = self.lock().get_mut(hash) {
            change(request);
        }
    }

    pub fn set_state(&self, hash: &str, state: TransferState) {
        self.update(hash, |request| request.state = state);
    }

    pub fn get(&self, hash: &str) -> Option<TransferRequest> {
        self.lock().get(hash).cloned()
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.lock().values().cloned().collect()
    }

    /// Hashes whose transfer has not reached a terminal state.
    pub fn pending(&self) -> BTreeSet<String> {
        self.lock().values().filter(|r| !r.state.is_terminal()).map(|r| r.hash.clone()).collect()
    }

    /// `(transferred, total)` bytes over every tracked request.
    pub fn progress(&self) -> (u64, u64) {
        self.lock().values().fold((0, 0), |(done, total), r| (done + r.transferred_bytes, total + r.total_bytes))
    }

    /// Drop every request that reached a terminal state.
    pub fn prune(&self) {
        self.lock().retain(|_, request| !request.state.is_terminal());
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
