//! Full reconciliation between the indexed roots and the index.

use crate::ContentCache;
use crate::error::{ErrorKind, Result};
use crate::models::Root;
use crate::store::IngestOutcome;
use async_stream::stream;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use time::{OffsetDateTime, UtcDateTime};
use tokio::fs;
use tracing::instrument;

/// Counts of what a rescan or a watcher reconciliation did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Indexed files that no longer exist.
    pub removed: usize,
    /// Indexed files whose modification time or size changed.
    pub reingested: usize,
    /// Files that were not indexed before.
    pub ingested: usize,
    pub unchanged: usize,
    /// Files that could not be read or indexed; retried on the next scan.
    pub failed: usize,
    /// Cache files whose content did not match their name; deleted.
    pub corrupt: usize,
}
impl ScanReport {
    fn merge(&mut self, other: ScanReport) {
        self.removed += other.removed;
        self.reingested += other.reingested;
        self.ingested += other.ingested;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.corrupt += other.corrupt;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// A rescan was already running; it will make another pass when done.
    Queued,
}

#[derive(Debug)]
struct DiskFile {
    root: Root,
    path: PathBuf,
    size: u64,
    modified: UtcDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Work {
    Ingest,
    Reingest,
}

impl ContentCache {
    /// Walk both roots and yield every file the cache indexes.
    fn walk(&self) -> BoxStream<'_, Result<DiskFile>> {
        let mut stack: Vec<PathBuf> = Vec::new();
        stack.push(self.settings.cache_directory.clone());
        if let Some(mods) = &self.settings.mod_directory {
            stack.push(mods.clone());
        }
        self.walk_from(stack)
    }

    /// Walk the directories in `stack` and everything below them.
    fn walk_from(&self, mut stack: Vec<PathBuf>) -> BoxStream<'_, Result<DiskFile>> {
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(err).raise(ErrorKind::Io(current.clone())));
                        continue 'dirs;
                    },
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(err) => {
                            yield Err(exn::Exn::from(err).raise(ErrorKind::Io(current.clone())));
                            break 'entries;
                        },
                    };
                    let path = entry.path();
                    // Follows symlinks; broken ones are dropped.
                    let Ok(metadata) = fs::metadata(&path).await else { continue 'entries };
                    if metadata.is_dir() {
                        // The cache directory is flat.
                        if !path.starts_with(&self.settings.cache_directory) {
                            stack.push(path);
                        }
                        continue 'entries;
                    }
                    let Some(root) = self.root_of(&path) else { continue 'entries };
                    let modified = metadata
                        .modified()
                        .map(|m| OffsetDateTime::from(m).to_utc())
                        .unwrap_or_else(|_| UtcDateTime::now());
                    yield Ok(DiskFile { root, path, size: metadata.len(), modified });
                }
            }
        })
    }

    /// Reconcile the index against both roots on disk.
    ///
    /// Deleted files leave the index, files whose modification time or size
    /// changed are re-hashed, unindexed files are ingested. Hashing runs on
    /// `scan_workers` files at a time. A rescan requested while one is
    /// running returns [`ScanOutcome::Queued`] and the running one makes
    /// another pass.
    pub async fn rescan(&self) -> Result<ScanOutcome> {
        self.scan_pending.store(true, Ordering::SeqCst);
        let mut report: Option<ScanReport> = None;
        loop {
            let Ok(guard) = self.scan_lock.try_lock() else {
                // Whoever holds the lock now consumes the pending flag.
                return Ok(match report {
                    Some(report) => ScanOutcome::Completed(report),
                    None => {
                        tracing::debug!("Rescan already running, queued another pass");
                        ScanOutcome::Queued
                    },
                });
            };
            let current = report.get_or_insert_with(ScanReport::default);
            while self.scan_pending.swap(false, Ordering::SeqCst) {
                current.merge(self.scan_once().await?);
            }
            self.evict().await?;
            drop(guard);
            // A request that arrived after the last pass found the lock
            // taken and left the flag for us.
            if !self.scan_pending.load(Ordering::SeqCst) {
                return Ok(ScanOutcome::Completed(report.unwrap_or_default()));
            }
        }
    }

    #[instrument(skip(self))]
    async fn scan_once(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut indexed: HashMap<PathBuf, Option<(u64, UtcDateTime)>> = {
            let index = self.read_index();
            index
                .paths()
                .map(|path| {
                    let meta = index
                        .key_for_path(path)
                        .and_then(|key| index.get(key))
                        .filter(|entry| entry.path == *path)
                        .map(|entry| (entry.size, entry.last_modified));
                    (path.clone(), meta)
                })
                .collect()
        };

        let mut work = Vec::new();
        let mut files = self.walk();
        while let Some(file) = files.next().await {
            let file = match file {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(error = %*err, "Skipping unreadable directory");
                    report.failed += 1;
                    continue;
                },
            };
            match indexed.remove(&file.path) {
                None => work.push((file.root, file.path, Work::Ingest)),
                // Duplicate copies are tracked by path only.
                Some(None) => report.unchanged += 1,
                Some(Some((size, modified))) if size == file.size && modified == file.modified => {
                    report.unchanged += 1;
                },
                Some(Some(_)) => work.push((file.root, file.path, Work::Reingest)),
            }
        }
        drop(files);

        // Whatever is left was not found on disk.
        for path in indexed.into_keys() {
            match self.remove_path(&path).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {},
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %*err, "Could not drop missing file from index");
                    report.failed += 1;
                },
            }
        }

        let workers = self.settings.scan_workers.max(1);
        let mut results = stream::iter(work)
            .map(|(root, path, kind)| async move { (kind, self.ingest_file(root, &path).await, path) })
            .buffer_unordered(workers);
        while let Some((kind, outcome, path)) = results.next().await {
            match outcome {
                Ok(IngestOutcome::Indexed(_) | IngestOutcome::Duplicate(_)) => match kind {
                    Work::Ingest => report.ingested += 1,
                    Work::Reingest => report.reingested += 1,
                },
                Ok(IngestOutcome::Missing) => report.removed += usize::from(kind == Work::Reingest),
                Ok(IngestOutcome::Unreadable) => report.failed += 1,
                Ok(IngestOutcome::Corrupt) => report.corrupt += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %*err, "Could not index file");
                    report.failed += 1;
                },
            }
        }
        tracing::info!(?report, "Rescan pass finished");
        Ok(report)
    }

    /// Bring the index up to date for specific paths, as reported by the
    /// file system watcher.
    ///
    /// Directories are walked and their files indexed. Paths that no longer
    /// exist, or are outside the indexed set, are dropped from the index
    /// together with everything indexed below them.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub async fn reconcile(&self, paths: BTreeSet<PathBuf>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut work: BTreeMap<PathBuf, Root> = BTreeMap::new();
        for path in paths {
            let metadata = fs::metadata(&path).await.ok();
            match metadata {
                Some(metadata) if metadata.is_file() => {
                    if let Some(root) = self.root_of(&path) {
                        work.insert(path, root);
                        continue;
                    }
                },
                Some(metadata) if metadata.is_dir() && self.is_watched_path(&path) => {
                    let mut files = self.walk_from(vec![path]);
                    while let Some(file) = files.next().await {
                        match file {
                            Ok(file) => {
                                work.insert(file.path, file.root);
                            },
                            Err(err) => {
                                tracing::warn!(error = %*err, "Skipping unreadable directory");
                                report.failed += 1;
                            },
                        }
                    }
                    continue;
                },
                _ => {},
            }
            report.removed += self.remove_below(&path).await?;
        }
        let workers = self.settings.scan_workers.max(1);
        let mut results = stream::iter(work)
            .map(|(path, root)| async move {
                let was_indexed = self.entry_for_path(&path).is_some();
                (was_indexed, self.ingest_file(root, &path).await, path)
            })
            .buffer_unordered(workers);
        while let Some((was_indexed, outcome, path)) = results.next().await {
            match outcome {
                Ok(IngestOutcome::Indexed(_) | IngestOutcome::Duplicate(_)) if was_indexed => report.reingested += 1,
                Ok(IngestOutcome::Indexed(_) | IngestOutcome::Duplicate(_)) => report.ingested += 1,
                Ok(IngestOutcome::Missing) => report.removed += usize::from(was_indexed),
                Ok(IngestOutcome::Unreadable) => report.failed += 1,
                Ok(IngestOutcome::Corrupt) => report.corrupt += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %*err, "Could not index file");
                    report.failed += 1;
                },
            }
        }
        self.evict().await?;
        Ok(report)
    }

    /// Drop `path` and every indexed path below it, returning how many
    /// entries left the index.
    async fn remove_below(&self, path: &Path) -> Result<usize> {
        let indexed: Vec<PathBuf> =
            self.read_index().paths().filter(|indexed| indexed.starts_with(path)).cloned().collect();
        let mut removed = 0;
        for indexed in indexed {
            if self.remove_path(&indexed).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Whether `path` is inside a directory the watcher should observe.
    pub(crate) fn is_watched_path(&self, path: &Path) -> bool {
        path.starts_with(&self.settings.cache_directory)
            || self.settings.mod_directory.as_deref().is_some_and(|mods| path.starts_with(mods))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;
    use crate::store::tests::{fixture, fixture_with};
    use std::time::{Duration, SystemTime};

    fn completed(outcome: ScanOutcome) -> ScanReport {
        match outcome {
            ScanOutcome::Completed(report) => report,
            ScanOutcome::Queued => panic!("scan was queued"),
        }
    }

    #[tokio::test]
    async fn test_rescan_classifies_files() {
        let f = fixture().await;
        let kept = f.write_mod("body/kept.tex", b"kept");
        let touched = f.write_mod("body/touched.mdl", b"before");
        let deleted = f.write_mod("deleted.mtrl", b"deleted");
        f.write_mod("notes/readme.txt", b"not an asset");
        let (cached_hash, _) = f.write_cached(b"downloaded earlier");

        let first = completed(f.cache.rescan().await.unwrap());
        assert_eq!(first.ingested, 4);
        assert_eq!(first.removed, 0);

        std::fs::remove_file(&deleted).unwrap();
        std::fs::write(&touched, b"after, and longer").unwrap();
        let added = f.write_mod("new/added.pap", b"added");

        let second = completed(f.cache.rescan().await.unwrap());
        assert_eq!(second.removed, 1);
        assert_eq!(second.reingested, 1);
        assert_eq!(second.ingested, 1);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.corrupt, 0);

        assert!(f.cache.entry_for_path(&kept).is_some());
        assert!(f.cache.entry_for_path(&deleted).is_none());
        assert_eq!(f.cache.entry_for_path(&touched).unwrap().hash, hash_bytes(b"after, and longer"));
        assert!(f.cache.entry_for_path(&added).is_some());
        assert!(f.cache.lookup(&cached_hash).is_some());
        assert!(f.cache.entry_for_path(&f.mods().join("notes/readme.txt")).is_none());
    }

    #[tokio::test]
    async fn test_rescan_deletes_corrupt_cache_files() {
        let f = fixture().await;
        let corrupt = f.cached().join(hash_bytes(b"what it should be"));
        std::fs::write(&corrupt, b"what it is").unwrap();
        let partial = f.cache.partial_directory().join("in-flight");
        std::fs::write(&partial, b"half a download").unwrap();

        let report = completed(f.cache.rescan().await.unwrap());
        assert_eq!(report.corrupt, 1);
        assert!(!corrupt.exists());
        assert!(partial.exists());
        assert!(f.cache.entries().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_detects_mtime_change() {
        let f = fixture().await;
        let path = f.write_mod("skin.tex", b"same size");
        completed(f.cache.rescan().await.unwrap());
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
        drop(file);
        let report = completed(f.cache.rescan().await.unwrap());
        assert_eq!(report.reingested, 1);
    }

    #[tokio::test]
    async fn test_rescan_queues_when_running() {
        let f = fixture().await;
        f.write_mod("a.tex", b"a");
        let guard = f.cache.scan_lock.lock().await;
        assert_eq!(f.cache.rescan().await.unwrap(), ScanOutcome::Queued);
        drop(guard);
        // The queued pass is picked up by the next scan that runs.
        let report = completed(f.cache.rescan().await.unwrap());
        assert_eq!(report.ingested, 1);
    }

    #[tokio::test]
    async fn test_rescan_requested_during_eviction_is_not_lost() {
        let f = fixture().await;
        // Eviction waits for the writer, holding the first pass there.
        let writer = f.cache.writer.lock().await;
        let (first, added) = tokio::join!(f.cache.rescan(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let added = f.write_mod("late/added.tex", b"arrived during eviction");
            assert_eq!(f.cache.rescan().await.unwrap(), ScanOutcome::Queued);
            drop(writer);
            added
        });
        let report = completed(first.unwrap());
        assert_eq!(report.ingested, 1);
        assert!(f.cache.entry_for_path(&added).is_some());
        assert!(!f.cache.scan_pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_rescans_index_once() {
        let f = fixture().await;
        for i in 0..20 {
            f.write_mod(&format!("dir{i}/file.tex"), format!("content {i}").as_bytes());
        }
        let (a, b) = tokio::join!(f.cache.rescan(), f.cache.rescan());
        let reports = [a.unwrap(), b.unwrap()];
        assert!(reports.iter().any(|r| matches!(r, ScanOutcome::Completed(_))));
        assert_eq!(f.cache.entries().len(), 20);
    }

    #[tokio::test]
    async fn test_rescan_evicts_over_ceiling() {
        let f = fixture_with(150).await;
        f.write_cached(&[1u8; 100]);
        f.write_cached(&[2u8; 100]);
        completed(f.cache.rescan().await.unwrap());
        assert_eq!(f.cache.stats().cache_entries, 1);
    }

    #[tokio::test]
    async fn test_reconcile_paths() {
        let f = fixture().await;
        let created = f.write_mod("created.tex", b"created");
        let removed = f.write_mod("removed.tex", b"removed");
        f.cache.ingest(&removed).await.unwrap();
        std::fs::remove_file(&removed).unwrap();

        let paths = BTreeSet::from([created.clone(), removed.clone(), f.mods().join("ignored.txt")]);
        let report = f.cache.reconcile(paths).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.removed, 1);
        assert!(f.cache.entry_for_path(&created).is_some());
        assert!(f.cache.entry_for_path(&removed).is_none());
    }

    #[tokio::test]
    async fn test_reconcile_deleted_directory() {
        let f = fixture().await;
        let nested = f.write_mod("sub/a.tex", b"a");
        let deeper = f.write_mod("sub/deeper/b.mdl", b"b");
        let sibling = f.write_mod("subway/c.tex", b"c");
        completed(f.cache.rescan().await.unwrap());

        std::fs::remove_dir_all(f.mods().join("sub")).unwrap();
        let report = f.cache.reconcile(BTreeSet::from([f.mods().join("sub")])).await.unwrap();
        assert_eq!(report.removed, 2);
        assert!(f.cache.entry_for_path(&nested).is_none());
        assert!(f.cache.entry_for_path(&deeper).is_none());
        assert!(f.cache.entry_for_path(&sibling).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_directory_moved_in() {
        let f = fixture().await;
        let first = f.write_mod("moved/a.tex", b"a");
        let second = f.write_mod("moved/inner/b.pap", b"b");
        f.write_mod("moved/readme.txt", b"not an asset");

        let report = f.cache.reconcile(BTreeSet::from([f.mods().join("moved"), first.clone()])).await.unwrap();
        assert_eq!(report.ingested, 2);
        assert!(f.cache.entry_for_path(&first).is_some());
        assert!(f.cache.entry_for_path(&second).is_some());
    }
}
