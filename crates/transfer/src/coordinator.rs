//! Fetching what a peer's snapshot needs, and serving what a peer lacks.

use crate::api::{FileSize, TransferApi};
use crate::error::{ErrorKind, Result};
use crate::forbidden::ForbiddenRegistry;
use crate::model::{TransferRequest, TransferState, TransferTracker};
use crate::settings::TransferSettings;
use bytes::Bytes;
use exn::ResultExt;
use futures::StreamExt;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{File, FileTimes};
use std::future::Future;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;
use url::Url;
use uuid::Uuid;
use veneer_cache::CacheHandle;
use veneer_cache::error::ErrorKind as CacheErrorKind;

pub type TransferApiHandle = Arc<dyn TransferApi>;

/// Downloaded files get timestamps this many days in the past.
const HISTORICAL_DAYS: std::ops::RangeInclusive<u64> = 1..=30;
const DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Already present locally; nothing was transferred.
    pub cached: BTreeSet<String>,
    pub downloaded: BTreeSet<String>,
    /// Denied by the server. The parts of the appearance using them stay
    /// unsynchronized.
    pub forbidden: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}
impl DownloadReport {
    /// Whether every required hash is now available locally.
    pub fn is_complete(&self) -> bool {
        self.forbidden.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: BTreeSet<String>,
    /// Verified within the re-verification window; not uploaded again.
    pub skipped_recent: BTreeSet<String>,
    pub forbidden: BTreeSet<String>,
    /// Not in the local cache (any more).
    pub missing_locally: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

/// Moves content-addressed files between the asset server and the local
/// [`ContentCache`](veneer_cache::ContentCache).
///
/// One coordinator is shared by every peer session; each download or upload
/// runs under the caller's cancellation token.
pub struct TransferCoordinator {
    api: TransferApiHandle,
    cache: CacheHandle,
    settings: TransferSettings,
    forbidden_downloads: ForbiddenRegistry,
    forbidden_uploads: ForbiddenRegistry,
    verified: Mutex<HashMap<String, Instant>>,
    cancellations: TaskTracker,
}

/// Run `future` unless `token` fires first.
async fn cancellable<T>(token: &CancellationToken, future: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
        result = future => result,
    }
}

async fn pause(token: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

impl TransferCoordinator {
    pub fn new(api: TransferApiHandle, cache: CacheHandle, settings: TransferSettings) -> Self {
        Self {
            api,
            cache,
            forbidden_downloads: ForbiddenRegistry::new(settings.forbidden_cooldown()),
            forbidden_uploads: ForbiddenRegistry::new(settings.forbidden_cooldown()),
            settings,
            verified: Mutex::new(HashMap::new()),
            cancellations: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn is_forbidden(&self, hash: &str) -> bool {
        self.forbidden_downloads.contains(hash)
    }

    /// Wait for every best-effort ticket cancellation spawned so far.
    pub async fn flush_cancellations(&self) {
        self.cancellations.close();
        self.cancellations.wait().await;
        self.cancellations.reopen();
    }

    /// Retry `attempt` on transient failures, up to the configured number of
    /// retries.
    async fn retrying<T, F, Fut>(&self, token: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && failures < self.settings.retries => {
                    failures += 1;
                    tracing::debug!(attempt = failures, error = %*err, "Retrying after transient failure");
                    pause(token, self.settings.retry_delay()).await?;
                },
                Err(err) => return Err(err),
            }
        }
    }

    // =====================================================================
    // Download
    // =====================================================================

    /// Make every hash in `required` available in the local cache.
    ///
    /// Hashes that are forbidden or fail are reported, not returned as
    /// errors. An error means the whole download could not proceed (the size
    /// query failed) or `token` was cancelled; in the latter case temporary
    /// files are gone and outstanding queue tickets are being cancelled in
    /// the background.
    #[instrument(skip_all, fields(peer = %peer, required = required.len()))]
    pub async fn download(
        &self,
        peer: &str,
        required: &BTreeSet<String>,
        tracker: &TransferTracker,
        token: &CancellationToken,
    ) -> Result<DownloadReport> {
        let indexed = self.cache.indexed_hashes();
        let (cached, missing): (BTreeSet<String>, BTreeSet<String>) =
            required.iter().cloned().partition(|hash| indexed.contains(hash));
        let (forbidden, missing) = self.forbidden_downloads.partition(&missing);
        if !forbidden.is_empty() {
            tracing::debug!(count = forbidden.len(), "Skipping hashes forbidden within the cooldown");
        }
        let mut report = DownloadReport { cached, forbidden, ..DownloadReport::default() };
        if missing.is_empty() {
            return Ok(report);
        }

        let query: Vec<String> = missing.iter().cloned().collect();
        let sizes = cancellable(token, self.api.sizes(&query)).await?;

        // One worker per origin (scheme, host and port).
        let mut origins: BTreeMap<String, (Url, Vec<FileSize>)> = BTreeMap::new();
        let mut answered = HashSet::new();
        for file in sizes {
            if !missing.contains(&file.hash) || !answered.insert(file.hash.clone()) {
                continue;
            }
            if file.forbidden {
                tracing::warn!(hash = %file.hash, "Asset is forbidden and will not be synchronized");
                self.forbidden_downloads.record(&file.hash);
                tracker.insert(TransferRequest {
                    state: TransferState::Forbidden,
                    ..TransferRequest::new(&file.hash, None, file.size)
                });
                report.forbidden.insert(file.hash);
                continue;
            }
            let source = file.url.clone().unwrap_or_else(|| self.api.base_url().clone());
            tracker.insert(TransferRequest::new(&file.hash, Some(source.clone()), file.size));
            let key = source.origin().ascii_serialization();
            origins.entry(key).or_insert_with(|| (origin_root(source), Vec::new())).1.push(file);
        }
        for hash in missing.iter().filter(|hash| !answered.contains(*hash)) {
            tracing::warn!(%hash, "Asset server does not know this asset");
            report.failed.insert(hash.clone());
        }

        tracing::info!(origins = origins.len(), missing = missing.len(), "Downloading missing assets");
        let workers = origins.into_values().map(|(origin, files)| self.download_from(origin, files, tracker, token));
        for (hash, result) in futures::future::join_all(workers).await.into_iter().flatten() {
            match result {
                Ok(()) => {
                    tracker.set_state(&hash, TransferState::Done);
                    report.downloaded.insert(hash);
                },
                Err(err) if err.is_cancellation() => {},
                Err(err) => {
                    tracing::warn!(%hash, error = %*err, "Asset download failed");
                    tracker.set_state(&hash, TransferState::Failed);
                    report.failed.insert(hash);
                },
            }
        }
        if token.is_cancelled() {
            tracing::debug!("Download cancelled");
            exn::bail!(ErrorKind::Cancelled);
        }
        tracing::info!(
            downloaded = report.downloaded.len(),
            forbidden = report.forbidden.len(),
            failed = report.failed.len(),
            "Download finished"
        );
        Ok(report)
    }

    /// Download `files` from one origin, one after the other.
    async fn download_from(
        &self,
        origin: Url,
        files: Vec<FileSize>,
        tracker: &TransferTracker,
        token: &CancellationToken,
    ) -> Vec<(String, Result<()>)> {
        let hashes: Vec<String> = files.iter().map(|file| file.hash.clone()).collect();
        if let Err(err) = cancellable(token, self.api.enqueue(&origin, &hashes)).await
            && !err.is_cancellation()
        {
            tracing::debug!(%origin, error = %*err, "Enqueue hint failed, requesting files anyway");
        }
        let origin = &origin;
        let mut results = Vec::with_capacity(files.len());
        for file in &files {
            if token.is_cancelled() {
                break;
            }
            let result = self.retrying(token, move || self.download_once(origin, file, tracker, token)).await;
            results.push((file.hash.clone(), result));
        }
        results
    }

    #[instrument(level = "debug", skip_all, fields(hash = %file.hash, origin = %origin))]
    async fn download_once(
        &self,
        origin: &Url,
        file: &FileSize,
        tracker: &TransferTracker,
        token: &CancellationToken,
    ) -> Result<()> {
        let hash = &file.hash;
        tracker.update(hash, |request| {
            request.state = TransferState::Queued;
            request.transferred_bytes = 0;
            request.request_id = None;
        });
        let ticket = cancellable(token, self.api.request(origin, hash)).await?;
        tracker.update(hash, |request| request.request_id = Some(ticket));

        let result = self.fetch(origin, ticket, file, tracker, token).await;
        if let Err(err) = &result
            && err.is_cancellation()
        {
            self.cancel_ticket(origin.clone(), ticket);
        }
        result
    }

    async fn fetch(
        &self,
        origin: &Url,
        ticket: Uuid,
        file: &FileSize,
        tracker: &TransferTracker,
        token: &CancellationToken,
    ) -> Result<()> {
        let hash = &file.hash;
        self.wait_ready(origin, ticket, hash, token).await?;
        tracker.set_state(hash, TransferState::Ready);

        let mut body = cancellable(token, self.api.stream(origin, ticket)).await?;
        tracker.set_state(hash, TransferState::Streaming);

        // Removed on drop, so every early return cleans up.
        let partial_directory = self.cache.partial_directory();
        let compressed = tempfile::Builder::new()
            .prefix(&format!("{hash}."))
            .suffix(".lz4")
            .tempfile_in(&partial_directory)
            .or_raise(|| ErrorKind::Io(partial_directory.clone()))?;
        let handle = compressed.as_file().try_clone().or_raise(|| ErrorKind::Io(compressed.path().to_path_buf()))?;
        let mut writer = tokio::fs::File::from_std(handle);
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            writer.write_all(&chunk).await.or_raise(|| ErrorKind::Io(compressed.path().to_path_buf()))?;
            tracker.update(hash, |request| request.transferred_bytes += chunk.len() as u64);
        }
        writer.flush().await.or_raise(|| ErrorKind::Io(compressed.path().to_path_buf()))?;
        drop(writer);

        let unpacked = {
            let directory = partial_directory.clone();
            tokio::task::spawn_blocking(move || unpack(compressed, &directory))
                .await
                .or_raise(|| ErrorKind::Io(partial_directory))??
        };
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }

        let entry = match self.cache.store(hash, &*unpacked).await {
            Ok(entry) => entry,
            Err(err) => {
                let corrupt = matches!(*err, CacheErrorKind::HashMismatch { .. });
                let kind = if corrupt { ErrorKind::HashMismatch(hash.clone()) } else { ErrorKind::Cache };
                return Err(err.raise(kind));
            },
        };
        tracker.update(hash, |request| request.transferred_bytes = request.total_bytes);
        tracing::debug!(size = entry.size, path = %entry.path.display(), "Stored downloaded asset");
        Ok(())
    }

    /// Poll the ticket until the server has the file ready.
    ///
    /// A status check that outlives the per-poll timeout is abandoned and
    /// re-issued; the ticket itself is kept.
    async fn wait_ready(&self, origin: &Url, ticket: Uuid, hash: &str, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.settings.queue_deadline();
        loop {
            let check = tokio::select! {
                _ = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
                check = tokio::time::timeout(self.settings.poll_timeout(), self.api.queue_status(origin, ticket)) => check,
            };
            match check {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {},
                Ok(Err(err)) => return Err(err),
                Err(_) => tracing::debug!(%ticket, "Queue status check timed out, re-checking"),
            }
            if Instant::now() >= deadline {
                exn::bail!(ErrorKind::QueueTimeout(hash.to_string()));
            }
            pause(token, self.settings.poll_interval()).await?;
        }
    }

    /// Tell the server to drop `ticket`, in the background.
    fn cancel_ticket(&self, origin: Url, ticket: Uuid) {
        let api = self.api.clone();
        let attempts = self.settings.cancel_attempts.max(1);
        let delay = self.settings.retry_delay();
        self.cancellations.spawn(async move {
            for attempt in 1..=attempts {
                match api.cancel(&origin, ticket).await {
                    Ok(()) => {
                        tracing::debug!(%ticket, "Cancelled queue ticket");
                        return;
                    },
                    Err(err) => tracing::debug!(%ticket, attempt, error = %*err, "Cancelling queue ticket failed"),
                }
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            tracing::warn!(%ticket, "Giving up on cancelling queue ticket");
        });
    }

    // =====================================================================
    // Upload
    // =====================================================================

    /// Upload the locally cached files among `hashes` that the server lets
    /// us upload.
    #[instrument(skip_all, fields(peer = %peer, hashes = hashes.len()))]
    pub async fn upload(&self, peer: &str, hashes: &BTreeSet<String>, token: &CancellationToken) -> Result<UploadReport> {
        let (forbidden, hashes) = self.forbidden_uploads.partition(hashes);
        let mut report = UploadReport { forbidden, ..UploadReport::default() };

        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        for hash in hashes {
            if self.recently_verified(&hash) {
                report.skipped_recent.insert(hash);
                continue;
            }
            match self.cache.lookup(&hash) {
                Some(entry) => candidates.push((hash, entry.path)),
                None => {
                    report.missing_locally.insert(hash);
                },
            }
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        let query: Vec<String> = candidates.iter().map(|(hash, _)| hash.clone()).collect();
        let denied: HashSet<String> = cancellable(token, self.api.upload_authorize(&query))
            .await?
            .into_iter()
            .filter(|authorization| authorization.forbidden)
            .map(|authorization| authorization.hash)
            .collect();

        for (hash, path) in candidates {
            if denied.contains(&hash) {
                tracing::warn!(%hash, "Upload forbidden");
                self.forbidden_uploads.record(&hash);
                report.forbidden.insert(hash);
                continue;
            }
            match self.upload_file(&hash, &path, token).await {
                Ok(()) => {
                    self.mark_verified(&hash);
                    report.uploaded.insert(hash);
                },
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    tracing::warn!(%hash, error = %*err, "Upload failed");
                    report.failed.insert(hash);
                },
            }
        }
        tracing::info!(uploaded = report.uploaded.len(), failed = report.failed.len(), "Upload finished");
        Ok(report)
    }

    #[instrument(level = "debug", skip(self, path, token), fields(path = %path.display()))]
    async fn upload_file(&self, hash: &str, path: &Path, token: &CancellationToken) -> Result<()> {
        let Some(body) = read_verified(hash, path).await? else {
            tracing::warn!("Local file no longer matches its hash, re-indexing");
            self.cache.ingest(path).await.or_raise(|| ErrorKind::Cache)?;
            exn::bail!(ErrorKind::HashMismatch(hash.to_string()));
        };
        let api = &self.api;
        self.retrying(token, move || cancellable(token, api.upload(hash, body.clone()))).await
    }

    fn recently_verified(&self, hash: &str) -> bool {
        let verified = self.verified.lock().unwrap_or_else(PoisonError::into_inner);
        verified.get(hash).is_some_and(|at| at.elapsed() < self.settings.reverify_window())
    }

    fn mark_verified(&self, hash: &str) {
        let mut verified = self.verified.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.settings.reverify_window();
        verified.retain(|_, at| at.elapsed() < window);
        verified.insert(hash.to_string(), Instant::now());
    }
}

/// `url` reduced to its scheme, host and port.
fn origin_root(mut url: Url) -> Url {
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Decompress a downloaded LZ4 frame next to it and backdate the result.
fn unpack(compressed: NamedTempFile, directory: &Path) -> Result<TempPath> {
    let output = NamedTempFile::new_in(directory).or_raise(|| ErrorKind::Io(directory.to_path_buf()))?;
    let source = File::open(compressed.path()).or_raise(|| ErrorKind::Io(compressed.path().to_path_buf()))?;
    let mut writer = BufWriter::new(output.as_file());
    veneer_compress::decompress_stream(BufReader::new(source), &mut writer).or_raise(|| ErrorKind::Compression)?;
    writer.flush().or_raise(|| ErrorKind::Io(output.path().to_path_buf()))?;
    drop(writer);
    stamp_historical(output.as_file()).or_raise(|| ErrorKind::Io(output.path().to_path_buf()))?;
    Ok(output.into_temp_path())
}

/// Set access and modification times to a random instant in the past.
fn stamp_historical(file: &File) -> std::io::Result<()> {
    let mut rng = rand::thread_rng();
    let age = rng.gen_range(HISTORICAL_DAYS.start() * DAY..=HISTORICAL_DAYS.end() * DAY);
    let at = SystemTime::now() - Duration::from_secs(age);
    file.set_times(FileTimes::new().set_accessed(at).set_modified(at))
}

/// Read a local file, check it still hashes to `hash` and compress it.
/// `None` when the content changed.
async fn read_verified(hash: &str, path: &Path) -> Result<Option<Bytes>> {
    let expected = hash.to_string();
    let source = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Option<Bytes>> {
        let data = std::fs::read(&source).or_raise(|| ErrorKind::Io(source.clone()))?;
        if veneer_cache::hash_bytes(&data) != expected {
            return Ok(None);
        }
        let compressed = veneer_compress::compress(&data).or_raise(|| ErrorKind::Compression)?;
        Ok(Some(Bytes::from(compressed)))
    })
    .await
    .or_raise(|| ErrorKind::Io(path.to_path_buf()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransferApi, TransferCall};
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;
    use veneer_cache::{CacheSettings, ContentCache, Database};

    struct Harness {
        dir: TempDir,
        cache: CacheHandle,
        api: Arc<MockTransferApi>,
        coordinator: Arc<TransferCoordinator>,
    }
    impl Harness {
        /// Put `data` into the managed cache directory and index it.
        async fn cache_file(&self, data: &[u8]) -> String {
            let hash = veneer_cache::hash_bytes(data);
            let path = self.cache.cache_directory().join(&hash);
            std::fs::write(&path, data).unwrap();
            self.cache.ingest(&path).await.unwrap().unwrap();
            hash
        }

        fn partial_files(&self) -> usize {
            std::fs::read_dir(self.cache.partial_directory()).unwrap().count()
        }
    }

    fn fast_settings() -> TransferSettings {
        TransferSettings {
            poll_timeout_ms: 1_000,
            poll_interval_ms: 1,
            queue_deadline_ms: 5_000,
            retries: 3,
            retry_delay_ms: 1,
            ..TransferSettings::default()
        }
    }

    async fn harness_with(settings: TransferSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mods")).unwrap();
        let cache_settings = CacheSettings {
            mod_directory: Some(dir.path().join("mods")),
            cache_directory: dir.path().join("cache"),
            ingest_attempts: 2,
            ingest_backoff_ms: 1,
            ..CacheSettings::default()
        };
        let db = Database::connect_in_memory().await.unwrap();
        let cache = Arc::new(ContentCache::open(cache_settings, &db).await.unwrap());
        let api = Arc::new(MockTransferApi::new());
        let coordinator = Arc::new(TransferCoordinator::new(api.clone(), cache.clone(), settings));
        Harness { dir, cache, api, coordinator }
    }

    async fn harness() -> Harness {
        harness_with(fast_settings()).await
    }

    fn set(hashes: &[&String]) -> BTreeSet<String> {
        hashes.iter().map(|hash| hash.to_string()).collect()
    }

    fn sizes_calls(api: &MockTransferApi) -> usize {
        api.calls().iter().filter(|call| matches!(call, TransferCall::Sizes(_))).count()
    }

    #[tokio::test]
    async fn test_downloads_only_what_is_missing() {
        let h = harness().await;
        let a = h.cache_file(b"already cached").await;
        let b_data = vec![0x42u8; 200];
        let b = h.api.add_file(&b_data);
        let c = veneer_cache::hash_bytes(b"not for you");
        h.api.forbid(&c);

        let tracker = TransferTracker::new();
        let report =
            h.coordinator.download("peer", &set(&[&a, &b, &c]), &tracker, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.cached, set(&[&a]));
        assert_eq!(report.downloaded, set(&[&b]));
        assert_eq!(report.forbidden, set(&[&c]));
        assert!(report.failed.is_empty());
        assert!(!report.is_complete());
        assert_eq!(h.api.requested(), vec![b.clone()]);

        let entry = h.cache.lookup(&b).unwrap();
        assert_eq!(entry.size, 200);
        assert_eq!(std::fs::read(&entry.path).unwrap(), b_data);
        assert_eq!(tracker.get(&b).unwrap().state, TransferState::Done);
        assert_eq!(tracker.get(&b).unwrap().transferred_bytes, 200);
        assert_eq!(tracker.get(&c).unwrap().state, TransferState::Forbidden);
        assert!(tracker.pending().is_empty());
        assert_eq!(h.partial_files(), 0);
    }

    #[tokio::test]
    async fn test_downloaded_files_are_backdated() {
        let h = harness().await;
        let hash = h.api.add_file(b"freshly downloaded");
        let required = set(&[&hash]);
        h.coordinator.download("peer", &required, &TransferTracker::new(), &CancellationToken::new()).await.unwrap();

        let path = h.cache.lookup(&hash).unwrap().path;
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let age = SystemTime::now().duration_since(modified).unwrap().as_secs();
        assert!(age >= DAY - 60, "modified only {age}s ago");
        assert!(age <= 30 * DAY + 60, "modified {age}s ago");
        assert!(modified > UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_forbidden_is_not_asked_again_within_cooldown() {
        let h = harness().await;
        let ok = h.api.add_file(b"allowed");
        let denied = veneer_cache::hash_bytes(b"denied");
        h.api.forbid(&denied);
        let required = set(&[&ok, &denied]);

        let first = h.coordinator.download("peer", &required, &TransferTracker::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(first.downloaded, set(&[&ok]));
        assert_eq!(first.forbidden, set(&[&denied]));
        assert!(h.coordinator.is_forbidden(&denied));

        let second = h.coordinator.download("peer", &required, &TransferTracker::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(second.cached, set(&[&ok]));
        assert_eq!(second.forbidden, set(&[&denied]));
        assert_eq!(sizes_calls(&h.api), 1);
        assert_eq!(h.api.requested(), vec![ok]);
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up() {
        let h = harness().await;
        let hash = h.api.add_file(&vec![7u8; 4096]);
        h.api.stall_stream(&hash);

        let tracker = TransferTracker::new();
        let token = CancellationToken::new();
        let task = {
            let coordinator = h.coordinator.clone();
            let (tracker, token) = (tracker.clone(), token.clone());
            let required = set(&[&hash]);
            tokio::spawn(async move { coordinator.download("peer", &required, &tracker, &token).await })
        };
        for _ in 0..200 {
            if tracker.get(&hash).is_some_and(|r| r.transferred_bytes > 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.get(&hash).unwrap().state, TransferState::Streaming);
        token.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(h.partial_files(), 0);
        assert!(h.cache.lookup(&hash).is_none());

        h.coordinator.flush_cancellations().await;
        let ticket = tracker.get(&hash).unwrap().request_id.unwrap();
        assert_eq!(h.api.cancelled(), vec![ticket]);
    }

    #[tokio::test]
    async fn test_ticket_cancellation_is_retried() {
        let h = harness().await;
        let hash = h.api.add_file(b"slow");
        h.api.set_ready_after(&hash, u32::MAX);
        h.api.fail_cancels(2);

        let tracker = TransferTracker::new();
        let token = CancellationToken::new();
        let task = {
            let coordinator = h.coordinator.clone();
            let (tracker, token) = (tracker.clone(), token.clone());
            let required = set(&[&hash]);
            tokio::spawn(async move { coordinator.download("peer", &required, &tracker, &token).await })
        };
        for _ in 0..200 {
            if tracker.get(&hash).is_some_and(|r| r.request_id.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancellation());

        h.coordinator.flush_cancellations().await;
        assert_eq!(h.api.cancelled().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness().await;
        let hash = h.api.add_file(b"flaky");
        h.api.fail_stream(&hash, 2, ErrorKind::Network);

        let report = h
            .coordinator
            .download("peer", &set(&[&hash]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, set(&[&hash]));
        assert_eq!(h.api.requested().len(), 3);
        assert_eq!(h.partial_files(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_do_not_affect_siblings() {
        let h = harness().await;
        let broken = h.api.add_file(b"always breaks");
        let fine = h.api.add_file(b"works");
        h.api.fail_stream(&broken, 10, ErrorKind::Network);

        let tracker = TransferTracker::new();
        let report = h
            .coordinator
            .download("peer", &set(&[&broken, &fine]), &tracker, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, set(&[&fine]));
        assert_eq!(report.failed, set(&[&broken]));
        assert_eq!(tracker.get(&broken).unwrap().state, TransferState::Failed);
        assert_eq!(h.api.requested().iter().filter(|hash| **hash == broken).count(), 4);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let h = harness().await;
        let hash = h.api.add_file(b"gone");
        h.api.fail_stream(&hash, 1, ErrorKind::NotFound(hash.clone()));

        let report = h
            .coordinator
            .download("peer", &set(&[&hash]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, set(&[&hash]));
        assert_eq!(h.api.requested().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_hash_fails() {
        let h = harness().await;
        let unknown = veneer_cache::hash_bytes(b"server never heard of it");
        let report = h
            .coordinator
            .download("peer", &set(&[&unknown]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, set(&[&unknown]));
        assert!(h.api.requested().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_queue() {
        let h = harness().await;
        let hash = h.api.add_file(b"queued");
        h.api.set_ready_after(&hash, 3);

        let report = h
            .coordinator
            .download("peer", &set(&[&hash]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, set(&[&hash]));
        let polls = h.api.calls().iter().filter(|call| matches!(call, TransferCall::QueueStatus(_))).count();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_queue_deadline() {
        let h = harness_with(TransferSettings { queue_deadline_ms: 20, retries: 0, ..fast_settings() }).await;
        let hash = h.api.add_file(b"never ready");
        h.api.set_ready_after(&hash, u32::MAX);

        let report = h
            .coordinator
            .download("peer", &set(&[&hash]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, set(&[&hash]));
    }

    #[tokio::test]
    async fn test_one_worker_per_origin() {
        let h = harness().await;
        let x = h.api.add_file_at("http://mirror.example:8080/", b"x");
        let y = h.api.add_file_at("http://mirror.example:8080/other/path", b"y");
        let z = h.api.add_file(b"z");

        let report = h
            .coordinator
            .download("peer", &set(&[&x, &y, &z]), &TransferTracker::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded.len(), 3);

        let mut enqueued: Vec<(String, usize)> = h
            .api
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                TransferCall::Enqueue { origin, hashes } => Some((origin, hashes.len())),
                _ => None,
            })
            .collect();
        enqueued.sort();
        assert_eq!(
            enqueued,
            vec![("http://assets.mock.invalid/".to_string(), 1), ("http://mirror.example:8080/".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_upload() {
        let h = harness().await;
        let sent = h.cache_file(b"share me").await;
        let denied = h.cache_file(b"keep me").await;
        let absent = veneer_cache::hash_bytes(b"not here");
        h.api.forbid_upload(&denied);

        let hashes = set(&[&sent, &denied, &absent]);
        let token = CancellationToken::new();
        let report = h.coordinator.upload("peer", &hashes, &token).await.unwrap();
        assert_eq!(report.uploaded, set(&[&sent]));
        assert_eq!(report.forbidden, set(&[&denied]));
        assert_eq!(report.missing_locally, set(&[&absent]));

        let body = h.api.uploads().remove(&sent).unwrap();
        assert_eq!(veneer_compress::decompress(&body).unwrap(), b"share me");

        h.api.clear_calls();
        let again = h.coordinator.upload("peer", &hashes, &token).await.unwrap();
        assert_eq!(again.skipped_recent, set(&[&sent]));
        assert_eq!(again.forbidden, set(&[&denied]));
        assert!(again.uploaded.is_empty());
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upload_detects_changed_file() {
        let h = harness().await;
        let path = h.dir.path().join("mods").join("body.tex");
        std::fs::write(&path, b"original").unwrap();
        let hash = h.cache.ingest(&path).await.unwrap().unwrap().hash;
        std::fs::write(&path, b"edited behind the index's back").unwrap();

        let report = h.coordinator.upload("peer", &set(&[&hash]), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, set(&[&hash]));
        assert!(h.api.uploads().is_empty());
        assert!(h.cache.lookup(&hash).is_none());
    }
}
