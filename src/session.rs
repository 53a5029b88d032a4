//! Per-peer orchestration: what gets downloaded and applied, for whom, and
//! when it stops.

use crate::error::{ErrorKind, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use veneer_apply::{ApplyOutcome, ApplyPipeline};
use veneer_host::CharacterRef;
use veneer_snapshot::{DataHash, Snapshot};
use veneer_transfer::{DownloadReport, TransferCoordinator, TransferTracker, UploadReport};

/// Label under which uploads of our own files are logged.
const LOCAL: &str = "local";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Network identity of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);
impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// A spawned sync; see [`PeerSessionManager::sync_peer`].
pub type SyncTask = JoinHandle<Result<Option<SyncReport>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub download: DownloadReport,
    pub apply: ApplyOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub character: CharacterRef,
    pub visible: bool,
    /// A snapshot has been received and not dropped since.
    pub has_snapshot: bool,
    pub applied: Option<DataHash>,
    /// `(transferred, total)` bytes of the session's downloads.
    pub progress: (u64, u64),
    pub pending: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub upload: UploadReport,
    /// Visible peers the snapshot should be sent to now.
    pub recipients: Vec<PeerId>,
}

/// Work done on behalf of a visible peer.
struct Session {
    token: CancellationToken,
    tracker: TransferTracker,
    /// The sync in flight. A newer one cancels it.
    sync: Option<CancellationToken>,
}
impl Session {
    fn new(token: CancellationToken) -> Self {
        Self { token, tracker: TransferTracker::new(), sync: None }
    }
}

struct Pair {
    character: CharacterRef,
    latest: Option<Arc<Snapshot>>,
    /// Present while the peer's character is visible.
    session: Option<Session>,
}

/// Maps paired peers to the characters they are rendered as and keeps those
/// characters in sync with the snapshots the peers send.
///
/// A session exists while a peer is visible. Ending it (the peer leaves
/// view, disconnects or is unpaired) cancels its downloads and reverts its
/// character. Each peer's work runs under its own token, so one peer
/// failing or being torn down never touches another.
pub struct PeerSessionManager {
    transfers: Arc<TransferCoordinator>,
    pipeline: Arc<ApplyPipeline>,
    shutdown: CancellationToken,
    pairs: Mutex<BTreeMap<PeerId, Pair>>,
}

impl PeerSessionManager {
    pub fn new(transfers: Arc<TransferCoordinator>, pipeline: Arc<ApplyPipeline>) -> Self {
        Self { transfers, pipeline, shutdown: CancellationToken::new(), pairs: Mutex::new(BTreeMap::new()) }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.pairs).keys().cloned().collect()
    }

    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        let pairs = lock(&self.pairs);
        let pair = pairs.get(peer)?;
        let (progress, pending) = pair
            .session
            .as_ref()
            .map(|session| (session.tracker.progress(), session.tracker.pending()))
            .unwrap_or_default();
        Some(PeerStatus {
            character: pair.character.clone(),
            visible: pair.session.is_some(),
            has_snapshot: pair.latest.is_some(),
            applied: self.pipeline.applied_hash(&pair.character),
            progress,
            pending,
        })
    }

    /// Pair with `peer`, whose character is `character`.
    ///
    /// Pairing an already paired peer with a different character ends the
    /// session on the old one; the new character becomes visible through
    /// [`on_visible`](Self::on_visible).
    #[instrument(skip_all, fields(peer = %peer, character = %character))]
    pub async fn pair(&self, peer: PeerId, character: CharacterRef) {
        let ended = {
            let mut pairs = lock(&self.pairs);
            match pairs.get_mut(&peer) {
                Some(pair) if pair.character == character => None,
                Some(pair) => {
                    let previous = std::mem::replace(&mut pair.character, character);
                    pair.session.take().map(|session| (previous, session))
                },
                None => {
                    pairs.insert(peer.clone(), Pair { character, latest: None, session: None });
                    tracing::info!("Paired");
                    None
                },
            }
        };
        if let Some((previous, session)) = ended {
            self.end(&peer, &previous, session).await;
        }
    }

    /// Forget `peer`, ending its session.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn unpair(&self, peer: &PeerId) {
        let Some(pair) = lock(&self.pairs).remove(peer) else {
            return;
        };
        if let Some(session) = pair.session {
            self.end(peer, &pair.character, session).await;
        }
        tracing::info!("Unpaired");
    }

    /// `peer`'s character came into view: start its session and sync the
    /// last snapshot it sent, if any.
    #[instrument(skip_all, fields(peer = %peer))]
    pub fn on_visible(self: &Arc<Self>, peer: &PeerId) -> Result<Option<SyncTask>> {
        {
            let mut pairs = lock(&self.pairs);
            let Some(pair) = pairs.get_mut(peer) else {
                exn::bail!(ErrorKind::UnknownPeer(peer.clone()));
            };
            if pair.session.is_some() {
                return Ok(None);
            }
            if self.shutdown.is_cancelled() {
                exn::bail!(ErrorKind::Cancelled);
            }
            pair.session = Some(Session::new(self.shutdown.child_token()));
            tracing::info!(character = %pair.character, "Peer visible, session started");
            if pair.latest.is_none() {
                return Ok(None);
            }
        }
        Ok(Some(self.spawn_sync(peer.clone())))
    }

    /// `peer`'s character left view: end the session. The last snapshot is
    /// kept and synced again when it comes back.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn on_invisible(&self, peer: &PeerId) {
        let ended = {
            let mut pairs = lock(&self.pairs);
            pairs.get_mut(peer).and_then(|pair| Some((pair.character.clone(), pair.session.take()?)))
        };
        if let Some((character, session)) = ended {
            self.end(peer, &character, session).await;
        }
    }

    /// `peer` went offline: end the session and drop its snapshot, which
    /// will be sent again when it reconnects.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn disconnect(&self, peer: &PeerId) {
        let ended = {
            let mut pairs = lock(&self.pairs);
            pairs.get_mut(peer).and_then(|pair| {
                pair.latest = None;
                Some((pair.character.clone(), pair.session.take()?))
            })
        };
        if let Some((character, session)) = ended {
            self.end(peer, &character, session).await;
        }
    }

    /// Record `snapshot` as `peer`'s current appearance and, if the peer is
    /// visible, sync it.
    #[instrument(skip_all, fields(peer = %peer))]
    pub fn receive_snapshot(self: &Arc<Self>, peer: &PeerId, snapshot: Snapshot) -> Result<Option<SyncTask>> {
        {
            let mut pairs = lock(&self.pairs);
            let Some(pair) = pairs.get_mut(peer) else {
                exn::bail!(ErrorKind::UnknownPeer(peer.clone()));
            };
            pair.latest = Some(Arc::new(snapshot));
            if pair.session.is_none() {
                tracing::debug!("Peer not visible, keeping the snapshot for later");
                return Ok(None);
            }
        }
        Ok(Some(self.spawn_sync(peer.clone())))
    }

    fn spawn_sync(self: &Arc<Self>, peer: PeerId) -> SyncTask {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.sync_peer(&peer).await })
    }

    /// Download whatever `peer`'s last snapshot needs, then apply it to the
    /// peer's character.
    ///
    /// `None` when the peer is not visible or has not sent a snapshot. A
    /// sync started while another one for the same peer is running cancels
    /// the older one.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn sync_peer(&self, peer: &PeerId) -> Result<Option<SyncReport>> {
        let (character, snapshot, tracker, token) = {
            let mut pairs = lock(&self.pairs);
            let Some(pair) = pairs.get_mut(peer) else {
                exn::bail!(ErrorKind::UnknownPeer(peer.clone()));
            };
            let (Some(snapshot), Some(session)) = (pair.latest.clone(), pair.session.as_mut()) else {
                return Ok(None);
            };
            let token = session.token.child_token();
            if let Some(previous) = session.sync.replace(token.clone()) {
                previous.cancel();
            }
            (pair.character.clone(), snapshot, session.tracker.clone(), token)
        };

        let result = self.run_sync(peer, &character, snapshot, &tracker, &token).await;
        match &result {
            Ok(report) => tracing::info!(
                downloaded = report.download.downloaded.len(),
                forbidden = report.download.forbidden.len(),
                failed = report.download.failed.len(),
                unchanged = matches!(report.apply, ApplyOutcome::Unchanged),
                "Synced peer"
            ),
            Err(err) if err.is_cancellation() => tracing::debug!("Sync cancelled"),
            Err(err) => tracing::warn!(error = %**err, "Sync failed"),
        }
        result.map(Some)
    }

    async fn run_sync(
        &self,
        peer: &PeerId,
        character: &CharacterRef,
        snapshot: Arc<Snapshot>,
        tracker: &TransferTracker,
        token: &CancellationToken,
    ) -> Result<SyncReport> {
        tracker.prune();
        let required = snapshot.required_hashes();
        let download = match self.transfers.download(peer.as_str(), &required, tracker, token).await {
            Ok(report) => report,
            Err(err) if err.is_cancellation() => return Err(err.raise(ErrorKind::Cancelled)),
            Err(err) => return Err(err.raise(ErrorKind::Transfer)),
        };
        if !download.forbidden.is_empty() {
            tracing::warn!(
                count = download.forbidden.len(),
                "Peer uses files the server will not hand out; those parts stay unsynchronized"
            );
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let apply = match self.pipeline.apply(character, snapshot, false, token).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancellation() => return Err(err.raise(ErrorKind::Cancelled)),
            Err(err) => return Err(err.raise(ErrorKind::Apply)),
        };
        Ok(SyncReport { download, apply })
    }

    /// Upload the files our own `snapshot` references and list the visible
    /// peers it should be sent to.
    #[instrument(skip_all)]
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<Published> {
        let token = self.shutdown.child_token();
        let upload = match self.transfers.upload(LOCAL, &snapshot.required_hashes(), &token).await {
            Ok(report) => report,
            Err(err) if err.is_cancellation() => return Err(err.raise(ErrorKind::Cancelled)),
            Err(err) => return Err(err.raise(ErrorKind::Transfer)),
        };
        let recipients = lock(&self.pairs)
            .iter()
            .filter(|(_, pair)| pair.session.is_some())
            .map(|(peer, _)| peer.clone())
            .collect();
        Ok(Published { upload, recipients })
    }

    async fn end(&self, peer: &PeerId, character: &CharacterRef, session: Session) {
        session.token.cancel();
        let report = self.pipeline.revert(character).await;
        tracing::info!(
            peer = %peer,
            reverted = report.reverted.len(),
            failures = report.failures,
            "Peer session ended"
        );
    }

    /// End every session, revert every character ever touched and wait for
    /// outstanding queue tickets to be cancelled on the server.
    ///
    /// No session can be started afterwards.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ended = {
            let mut pairs = lock(&self.pairs);
            pairs.values_mut().filter_map(|pair| pair.session.take()).count()
        };
        let reverted = self.pipeline.revert_all().await;
        self.transfers.flush_cancellations().await;
        tracing::info!(sessions = ended, characters = reverted.len(), "Shut down peer sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use veneer_apply::ApplySettings;
    use veneer_cache::{CacheHandle, CacheSettings, ContentCache, Database};
    use veneer_host::mock::{CallLog, HostCall, MockModService, MockObjectTable};
    use veneer_host::{Cosmetics, ObjectKind};
    use veneer_snapshot::{FileReplacement, Fragment, ReplacementTarget};
    use veneer_transfer::mock::MockTransferApi;
    use veneer_transfer::TransferSettings;

    struct Harness {
        _dir: TempDir,
        cache: CacheHandle,
        api: Arc<MockTransferApi>,
        objects: Arc<MockObjectTable>,
        log: CallLog,
        transfers: Arc<TransferCoordinator>,
        manager: Arc<PeerSessionManager>,
    }
    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache_settings = CacheSettings { cache_directory: dir.path().join("cache"), ..CacheSettings::default() };
            let db = Database::connect_in_memory().await.unwrap();
            let cache = Arc::new(ContentCache::open(cache_settings, &db).await.unwrap());
            let api = Arc::new(MockTransferApi::new());
            let transfer_settings = TransferSettings {
                poll_timeout_ms: 1_000,
                poll_interval_ms: 1,
                queue_deadline_ms: 5_000,
                retries: 1,
                retry_delay_ms: 1,
                ..TransferSettings::default()
            };
            let transfers = Arc::new(TransferCoordinator::new(api.clone(), cache.clone(), transfer_settings));
            let log = CallLog::new();
            let objects = Arc::new(MockObjectTable::new());
            let mods = Arc::new(MockModService::new(log.clone()));
            let apply_settings = ApplySettings {
                draw_poll_interval_ms: 1,
                draw_poll_timeout_ms: 20,
                draw_hard_cap_ms: 5_000,
                redraw_timeout_ms: 5_000,
            };
            let pipeline =
                Arc::new(ApplyPipeline::new(objects.clone(), mods, Cosmetics::new(), cache.clone(), apply_settings));
            let manager = Arc::new(PeerSessionManager::new(transfers.clone(), pipeline));
            Self { _dir: dir, cache, api, objects, log, transfers, manager }
        }

        async fn cache_file(&self, data: &[u8]) -> String {
            let hash = veneer_cache::hash_bytes(data);
            let path = self.cache.cache_directory().join(&hash);
            std::fs::write(&path, data).unwrap();
            self.cache.ingest(&path).await.unwrap().unwrap();
            hash
        }

        fn path(&self, hash: &str) -> String {
            self.cache.lookup(hash).unwrap().path.to_string_lossy().into_owned()
        }

        /// Pair `peer` with a spawned player character at `index`.
        async fn visible_peer(&self, peer: &str, index: u16) -> (PeerId, CharacterRef) {
            let peer = PeerId::new(peer);
            let character = CharacterRef::new(format!("{peer}@World"));
            self.objects.spawn(&character, ObjectKind::Player, index, ["chara/body.mdl"]);
            self.manager.pair(peer.clone(), character.clone()).await;
            assert!(self.manager.on_visible(&peer).unwrap().is_none());
            (peer, character)
        }
    }

    fn snapshot(files: &[(&str, &String)]) -> Snapshot {
        let fragment = Fragment {
            replacements: files
                .iter()
                .map(|(path, hash)| FileReplacement::new([*path], ReplacementTarget::Hash(hash.to_string())))
                .collect(),
            ..Fragment::default()
        };
        Snapshot::default().with_fragment(ObjectKind::Player, fragment)
    }

    async fn finish(task: Option<SyncTask>) -> SyncReport {
        task.expect("a sync should have been spawned").await.unwrap().unwrap().unwrap()
    }

    fn applied(report: &SyncReport) -> &veneer_apply::ApplyReport {
        match &report.apply {
            ApplyOutcome::Applied(report) => report,
            ApplyOutcome::Unchanged => panic!("expected an apply"),
        }
    }

    #[tokio::test]
    async fn test_cached_downloaded_and_forbidden_files() {
        let h = Harness::new().await;
        let a = h.cache_file(b"already cached").await;
        let b = h.api.add_file(&[0x42; 200]);
        let c = veneer_cache::hash_bytes(b"not for you");
        h.api.forbid(&c);
        let (peer, _) = h.visible_peer("peer-a", 2).await;

        let task = h
            .manager
            .receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a), ("chara/b.tex", &b), ("chara/c.tex", &c)]))
            .unwrap();
        let report = finish(task).await;

        assert_eq!(h.api.requested(), vec![b.clone()]);
        assert_eq!(report.download.cached, BTreeSet::from([a.clone()]));
        assert_eq!(report.download.downloaded, BTreeSet::from([b.clone()]));
        assert_eq!(report.download.forbidden, BTreeSet::from([c.clone()]));
        let apply = applied(&report);
        assert_eq!(
            apply.remap[&ObjectKind::Player],
            BTreeMap::from([("chara/a.tex".to_string(), h.path(&a)), ("chara/b.tex".to_string(), h.path(&b))])
        );
        assert_eq!(apply.missing, BTreeSet::from([c]));
        // Not fully applied while a file is unavailable.
        assert_eq!(h.manager.status(&peer).unwrap().applied, None);
    }

    #[tokio::test]
    async fn test_snapshot_waits_for_visibility() {
        let h = Harness::new().await;
        let a = h.cache_file(b"texture").await;
        let peer = PeerId::new("peer-a");
        let character = CharacterRef::new("peer-a@World");
        h.objects.spawn(&character, ObjectKind::Player, 4, ["chara/body.mdl"]);
        h.manager.pair(peer.clone(), character).await;

        assert!(h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a)])).unwrap().is_none());
        assert!(h.log.is_empty());
        let status = h.manager.status(&peer).unwrap();
        assert!(status.has_snapshot);
        assert!(!status.visible);

        let report = finish(h.manager.on_visible(&peer).unwrap()).await;
        assert_eq!(applied(&report).applied, BTreeSet::from([ObjectKind::Player]));
        // Visible already; nothing new to do.
        assert!(h.manager.on_visible(&peer).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let h = Harness::new().await;
        let peer = PeerId::new("stranger");
        let err = h.manager.receive_snapshot(&peer, Snapshot::default()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownPeer(id) if *id == peer));
        assert!(h.manager.on_visible(&peer).is_err());
        assert!(h.manager.sync_peer(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_leaving_view_cancels_downloads_and_reverts() {
        let h = Harness::new().await;
        let a = h.cache_file(b"texture").await;
        let (peer, character) = h.visible_peer("peer-a", 2).await;
        finish(h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a)])).unwrap()).await;

        let b = h.api.add_file(&vec![7u8; 4096]);
        h.api.stall_stream(&b);
        let task = h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a), ("chara/b.tex", &b)])).unwrap();
        for _ in 0..200 {
            if h.manager.status(&peer).unwrap().progress.0 > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.manager.status(&peer).unwrap().pending, BTreeSet::from([b.clone()]));
        h.log.clear();

        h.manager.on_invisible(&peer).await;
        let err = task.unwrap().await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(std::fs::read_dir(h.cache.partial_directory()).unwrap().count(), 0);
        assert!(h.cache.lookup(&b).is_none());
        assert_eq!(h.log.calls(), vec![HostCall::Redraw(veneer_host::ObjectIndex(2))]);

        let status = h.manager.status(&peer).unwrap();
        assert!(!status.visible);
        assert!(status.has_snapshot);
        assert_eq!(status.applied, None);
        h.transfers.flush_cancellations().await;
        assert_eq!(h.api.cancelled().len(), 1);

        // Coming back into view syncs the kept snapshot again.
        h.objects.spawn(&character, ObjectKind::Player, 2, ["chara/body.mdl"]);
        assert!(h.manager.on_visible(&peer).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_newer_snapshot_supersedes_running_sync() {
        let h = Harness::new().await;
        let (peer, _) = h.visible_peer("peer-a", 2).await;
        let slow = h.api.add_file(&vec![1u8; 4096]);
        h.api.stall_stream(&slow);
        let first = h.manager.receive_snapshot(&peer, snapshot(&[("chara/slow.tex", &slow)])).unwrap();
        for _ in 0..200 {
            if h.manager.status(&peer).unwrap().progress.0 > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let a = h.cache_file(b"texture").await;
        let second = finish(h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a)])).unwrap()).await;
        assert!(first.unwrap().await.unwrap().unwrap_err().is_cancellation());
        assert_eq!(applied(&second).applied, BTreeSet::from([ObjectKind::Player]));
        assert!(h.manager.status(&peer).unwrap().visible);
    }

    #[tokio::test]
    async fn test_one_peer_failing_does_not_affect_another() {
        let h = Harness::new().await;
        let broken = h.api.add_file(b"broken on the server");
        h.api.fail_stream(&broken, 2, veneer_transfer::error::ErrorKind::Network);
        let fine = h.api.add_file(b"fine");
        let (first, _) = h.visible_peer("peer-a", 2).await;
        let (second, _) = h.visible_peer("peer-b", 3).await;

        let (peer_a, peer_b) = (first, second);
        let first = h.manager.receive_snapshot(&peer_a, snapshot(&[("chara/x.tex", &broken)])).unwrap();
        let second = h.manager.receive_snapshot(&peer_b, snapshot(&[("chara/y.tex", &fine)])).unwrap();
        let (first, second) = (finish(first).await, finish(second).await);

        assert_eq!(first.download.failed, BTreeSet::from([broken.clone()]));
        assert_eq!(applied(&first).missing, BTreeSet::from([broken.clone()]));
        assert_eq!(h.manager.status(&peer_a).unwrap().applied, None);
        assert!(second.download.is_complete());
        assert!(applied(&second).is_complete());

        // The server recovers: syncing the same snapshot again fetches the
        // file and remaps it.
        let retried = h.manager.sync_peer(&peer_a).await.unwrap().unwrap();
        assert_eq!(retried.download.downloaded, BTreeSet::from([broken.clone()]));
        let report = applied(&retried);
        assert!(report.is_complete());
        assert_eq!(report.remap[&ObjectKind::Player]["chara/x.tex"], h.path(&broken));
        assert!(h.manager.status(&peer_a).unwrap().applied.is_some());

        let again = h.manager.sync_peer(&peer_a).await.unwrap().unwrap();
        assert_eq!(again.apply, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_disconnect_drops_the_snapshot() {
        let h = Harness::new().await;
        let a = h.cache_file(b"texture").await;
        let (peer, _) = h.visible_peer("peer-a", 2).await;
        finish(h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a)])).unwrap()).await;

        h.manager.disconnect(&peer).await;
        let status = h.manager.status(&peer).unwrap();
        assert!(!status.visible);
        assert!(!status.has_snapshot);
        assert!(h.manager.on_visible(&peer).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpair_and_repair() {
        let h = Harness::new().await;
        let a = h.cache_file(b"texture").await;
        let (peer, character) = h.visible_peer("peer-a", 2).await;
        finish(h.manager.receive_snapshot(&peer, snapshot(&[("chara/a.tex", &a)])).unwrap()).await;

        // Same character again: nothing happens.
        h.log.clear();
        h.manager.pair(peer.clone(), character.clone()).await;
        assert!(h.log.is_empty());
        assert!(h.manager.status(&peer).unwrap().visible);

        // Another character: the old one is reverted.
        h.manager.pair(peer.clone(), CharacterRef::new("alt@World")).await;
        assert_eq!(h.log.calls(), vec![HostCall::Redraw(veneer_host::ObjectIndex(2))]);
        assert!(!h.manager.status(&peer).unwrap().visible);

        h.manager.unpair(&peer).await;
        assert!(h.manager.peers().is_empty());
        assert!(h.manager.receive_snapshot(&peer, Snapshot::default()).is_err());
    }

    #[tokio::test]
    async fn test_publish_uploads_and_lists_visible_peers() {
        let h = Harness::new().await;
        let ours = h.cache_file(b"our texture").await;
        let (visible, _) = h.visible_peer("peer-a", 2).await;
        h.manager.pair(PeerId::new("peer-b"), CharacterRef::new("peer-b@World")).await;

        let published = h.manager.publish(&snapshot(&[("chara/ours.tex", &ours)])).await.unwrap();
        assert_eq!(published.upload.uploaded, BTreeSet::from([ours.clone()]));
        assert_eq!(published.recipients, vec![visible]);
        assert!(h.api.uploads().contains_key(&ours));
    }

    #[tokio::test]
    async fn test_shutdown_reverts_everyone() {
        let h = Harness::new().await;
        let a = h.cache_file(b"texture").await;
        let (first, _) = h.visible_peer("peer-a", 2).await;
        let (second, _) = h.visible_peer("peer-b", 3).await;
        for peer in [&first, &second] {
            finish(h.manager.receive_snapshot(peer, snapshot(&[("chara/a.tex", &a)])).unwrap()).await;
        }
        h.log.clear();

        h.manager.shutdown().await;
        let mut redrawn: Vec<_> = h
            .log
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Redraw(index) => Some(index.0),
                _ => None,
            })
            .collect();
        redrawn.sort_unstable();
        assert_eq!(redrawn, vec![2, 3]);
        for peer in [&first, &second] {
            let status = h.manager.status(peer).unwrap();
            assert!(!status.visible);
            assert_eq!(status.applied, None);
        }
        let err = h.manager.on_visible(&first).unwrap_err();
        assert!(err.is_cancellation());
    }
}
