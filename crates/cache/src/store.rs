//! The content cache service.

use crate::error::{ErrorKind, Result};
use crate::hash::{FileDigest, digest_file, is_hash};
use crate::models::{ContentEntry, Root};
use crate::{CacheSettings, Database, Repository};
use exn::{OptionExt, ResultExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::UtcDateTime;
use tokio::fs;
use tracing::instrument;

/// Sub-directory of the cache directory holding in-progress downloads.
pub const PARTIAL_DIRECTORY: &str = ".partial";

pub(crate) type Key = (Root, String);

/// In-memory view of the index.
///
/// Duplicate content within one root is indexed once; further paths holding
/// the same bytes are kept as aliases so the entry survives deletion of any
/// single copy. Aliases are not persisted: the next rescan finds them again.
#[derive(Debug, Default)]
pub(crate) struct Index {
    entries: HashMap<Key, ContentEntry>,
    by_path: HashMap<PathBuf, Key>,
    aliases: HashMap<Key, BTreeSet<PathBuf>>,
}

/// What detaching a path from the index did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Detached {
    NotIndexed,
    Alias,
    /// The entry is gone from the index.
    Removed(ContentEntry),
    /// The entry lives on at one of its aliases.
    Promoted(ContentEntry),
}

impl Index {
    fn insert(&mut self, entry: ContentEntry) {
        let key = (entry.root, entry.hash.clone());
        if let Some(previous) = self.entries.get(&key)
            && previous.path != entry.path
        {
            self.by_path.remove(&previous.path);
        }
        if let Some(aliases) = self.aliases.get_mut(&key) {
            aliases.remove(&entry.path);
        }
        self.by_path.insert(entry.path.clone(), key.clone());
        self.entries.insert(key, entry);
    }

    fn add_alias(&mut self, key: Key, path: PathBuf) {
        self.by_path.insert(path.clone(), key.clone());
        self.aliases.entry(key).or_default().insert(path);
    }

    fn detach(&mut self, path: &Path) -> Detached {
        let Some(key) = self.by_path.remove(path) else {
            return Detached::NotIndexed;
        };
        let is_primary = self.entries.get(&key).is_some_and(|e| e.path == path);
        if !is_primary {
            if let Some(aliases) = self.aliases.get_mut(&key) {
                aliases.remove(path);
            }
            return Detached::Alias;
        }
        let promoted = self.aliases.get_mut(&key).and_then(|aliases| aliases.pop_first());
        match (promoted, self.entries.remove(&key)) {
            (Some(alias), Some(mut entry)) => {
                entry.path = alias;
                self.entries.insert(key, entry.clone());
                Detached::Promoted(entry)
            },
            (None, Some(entry)) => {
                self.aliases.remove(&key);
                Detached::Removed(entry)
            },
            (_, None) => Detached::NotIndexed,
        }
    }

    fn remove(&mut self, key: &Key) -> Option<ContentEntry> {
        let entry = self.entries.remove(key)?;
        self.by_path.remove(&entry.path);
        for alias in self.aliases.remove(key).unwrap_or_default() {
            self.by_path.remove(&alias);
        }
        Some(entry)
    }

    pub(crate) fn key_for_path(&self, path: &Path) -> Option<&Key> {
        self.by_path.get(path)
    }

    pub(crate) fn get(&self, key: &Key) -> Option<&ContentEntry> {
        self.entries.get(key)
    }

    /// Every indexed path, primary and alias.
    pub(crate) fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.by_path.keys()
    }
}

/// Outcome of hashing and indexing one file.
#[derive(Debug)]
pub(crate) enum IngestOutcome {
    /// The file is the primary copy of a new or updated entry.
    Indexed(ContentEntry),
    /// Same bytes as an entry already indexed at another path in this root.
    Duplicate(ContentEntry),
    /// Gone before it could be hashed.
    Missing,
    /// Could not be read within the configured attempts.
    Unreadable,
    /// A cache-root file whose name is not its content hash; deleted.
    Corrupt,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted hashes, oldest access first.
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    /// Managed cache size after eviction.
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub mod_entries: usize,
    pub mod_bytes: u64,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub pinned: usize,
}

type PinCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps a set of hashes non-evictable until dropped.
#[derive(Debug)]
#[must_use = "hashes are unpinned as soon as the guard is dropped"]
pub struct PinGuard {
    pins: PinCounts,
    hashes: Vec<String>,
}
impl PinGuard {
    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }
}
impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        for hash in &self.hashes {
            if let Some(count) = pins.get_mut(hash) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(hash);
                }
            }
        }
    }
}

/// Hash-indexed view over the mod directory and the managed cache directory.
pub struct ContentCache {
    pub(crate) settings: CacheSettings,
    index: RwLock<Index>,
    /// The single serialization point for index mutations.
    pub(crate) writer: tokio::sync::Mutex<Repository>,
    pins: PinCounts,
    pub(crate) scan_lock: tokio::sync::Mutex<()>,
    pub(crate) scan_pending: AtomicBool,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("mod_directory", &self.settings.mod_directory)
            .field("cache_directory", &self.settings.cache_directory)
            .finish_non_exhaustive()
    }
}

fn require_absolute(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
    }
    Ok(())
}

impl ContentCache {
    /// Create the cache directories and load the persisted index.
    #[instrument(skip_all, fields(cache = %settings.cache_directory.display()))]
    pub async fn open(settings: CacheSettings, database: &Database) -> Result<Self> {
        require_absolute(&settings.cache_directory)?;
        if let Some(mods) = &settings.mod_directory {
            require_absolute(mods)?;
        }
        let partial = settings.cache_directory.join(PARTIAL_DIRECTORY);
        fs::create_dir_all(&partial).await.or_raise(|| ErrorKind::Io(partial.clone()))?;

        let repository = database.repository();
        let mut index = Index::default();
        for entry in repository.list().await? {
            index.insert(entry);
        }
        tracing::info!(entries = index.entries.len(), "Loaded content index");
        Ok(Self {
            settings,
            index: RwLock::new(index),
            writer: tokio::sync::Mutex::new(repository),
            pins: PinCounts::default(),
            scan_lock: tokio::sync::Mutex::new(()),
            scan_pending: AtomicBool::new(false),
        })
    }

    pub(crate) fn read_index(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn cache_directory(&self) -> &Path {
        &self.settings.cache_directory
    }

    /// Where in-progress downloads are written. Ignored by scans and the
    /// watcher.
    pub fn partial_directory(&self) -> PathBuf {
        self.settings.cache_directory.join(PARTIAL_DIRECTORY)
    }

    /// Which root `path` belongs to, or `None` if it is not something the
    /// cache indexes: outside both roots, a temporary download, or a mod file
    /// with an extension that isn't an asset.
    pub fn root_of(&self, path: &Path) -> Option<Root> {
        if path.components().any(|c| c == Component::ParentDir) {
            return None;
        }
        if let Ok(relative) = path.strip_prefix(&self.settings.cache_directory) {
            let mut components = relative.components();
            return match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) if !name.to_string_lossy().starts_with('.') => Some(Root::Cache),
                _ => None,
            };
        }
        let mods = self.settings.mod_directory.as_deref()?;
        if path.strip_prefix(mods).is_ok_and(|relative| relative.components().next().is_some()) {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            return self.settings.is_asset_extension(extension).then_some(Root::Mods);
        }
        None
    }

    /// Entry for `hash`, preferring the mod directory's copy.
    ///
    /// Trusts the index; does not check the file still exists.
    pub fn lookup(&self, hash: &str) -> Option<ContentEntry> {
        let index = self.read_index();
        [Root::Mods, Root::Cache].into_iter().find_map(|root| index.get(&(root, hash.to_string())).cloned())
    }

    /// The entry indexed at `path`, whether it is the primary copy or not.
    pub fn entry_for_path(&self, path: &Path) -> Option<ContentEntry> {
        let index = self.read_index();
        let key = index.key_for_path(path)?;
        index.get(key).map(|entry| ContentEntry { path: path.to_path_buf(), ..entry.clone() })
    }

    /// Every hash present in either root.
    pub fn indexed_hashes(&self) -> HashSet<String> {
        self.read_index().entries.keys().map(|(_, hash)| hash.clone()).collect()
    }

    pub fn entries(&self) -> Vec<ContentEntry> {
        let mut entries: Vec<_> = self.read_index().entries.values().cloned().collect();
        entries.sort_by(|a, b| (a.root, &a.hash).cmp(&(b.root, &b.hash)));
        entries
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.read_index();
        let mut stats = CacheStats { pinned: self.lock_pins().len(), ..CacheStats::default() };
        for entry in index.entries.values() {
            match entry.root {
                Root::Mods => {
                    stats.mod_entries += 1;
                    stats.mod_bytes += entry.size;
                },
                Root::Cache => {
                    stats.cache_entries += 1;
                    stats.cache_bytes += entry.size;
                },
            }
        }
        stats
    }

    /// Lookup on behalf of an apply: records the access so the entry is the
    /// last candidate for eviction.
    pub async fn acquire(&self, hash: &str) -> Result<Option<ContentEntry>> {
        self.touch(hash, UtcDateTime::now()).await
    }

    /// Record an access of `hash` at `at` in every root that holds it.
    /// Access times only move forward.
    pub async fn touch(&self, hash: &str, at: UtcDateTime) -> Result<Option<ContentEntry>> {
        if self.lookup(hash).is_none() {
            return Ok(None);
        }
        let repository = self.writer.lock().await;
        for root in [Root::Mods, Root::Cache] {
            let key = (root, hash.to_string());
            if self.read_index().get(&key).is_none() {
                continue;
            }
            repository.touch(root, hash, at).await?;
            if let Some(entry) = self.write_index().entries.get_mut(&key) {
                entry.last_accessed = entry.last_accessed.max(at);
            }
        }
        drop(repository);
        Ok(self.lookup(hash))
    }

    fn lock_pins(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `hashes` non-evictable until the guard drops. Pins nest.
    pub fn pin<I, S>(&self, hashes: I) -> PinGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hashes: Vec<String> = hashes.into_iter().map(Into::into).collect::<BTreeSet<_>>().into_iter().collect();
        let mut pins = self.lock_pins();
        for hash in &hashes {
            *pins.entry(hash.clone()).or_default() += 1;
        }
        PinGuard { pins: self.pins.clone(), hashes }
    }

    pub fn is_pinned(&self, hash: &str) -> bool {
        self.lock_pins().contains_key(hash)
    }

    /// Hash `path` and index it.
    ///
    /// Returns `None` when the file could not be indexed: it vanished, stayed
    /// unreadable for every attempt, or (in the cache directory) its content
    /// did not match its name. Ingesting into the cache directory may trigger
    /// eviction.
    pub async fn ingest(&self, path: impl AsRef<Path>) -> Result<Option<ContentEntry>> {
        let path = path.as_ref();
        let root = self.root_of(path).ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?;
        let outcome = self.ingest_file(root, path).await?;
        if root == Root::Cache && matches!(outcome, IngestOutcome::Indexed(_)) {
            self.evict().await?;
        }
        Ok(match outcome {
            IngestOutcome::Indexed(entry) | IngestOutcome::Duplicate(entry) => Some(entry),
            IngestOutcome::Missing | IngestOutcome::Unreadable | IngestOutcome::Corrupt => None,
        })
    }

    #[instrument(level = "debug", skip(self), fields(hash))]
    pub(crate) async fn ingest_file(&self, root: Root, path: &Path) -> Result<IngestOutcome> {
        let digest = match digest_file(path, self.settings.ingest_attempts, self.settings.ingest_backoff()).await {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                self.remove_path(path).await?;
                return Ok(IngestOutcome::Missing);
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %*err, "Giving up on unreadable file");
                return Ok(IngestOutcome::Unreadable);
            },
        };
        tracing::Span::current().record("hash", digest.hash.as_str());
        if root == Root::Cache && path.file_name().and_then(|n| n.to_str()) != Some(digest.hash.as_str()) {
            tracing::warn!(path = %path.display(), actual = %digest.hash, "Deleting corrupt cache file");
            match fs::remove_file(path).await {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => return Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
            }
            self.remove_path(path).await?;
            return Ok(IngestOutcome::Corrupt);
        }
        self.index_digest(root, path, digest).await
    }

    async fn index_digest(&self, root: Root, path: &Path, digest: FileDigest) -> Result<IngestOutcome> {
        let repository = self.writer.lock().await;
        let key = (root, digest.hash.clone());

        // The path used to hold other content.
        let stale = self.read_index().key_for_path(path).is_some_and(|k| *k != key);
        if stale {
            let detached = self.write_index().detach(path);
            Self::persist_detached(&repository, path, detached).await?;
        }

        let existing = self.read_index().get(&key).cloned();
        if let Some(existing) = &existing
            && existing.path != path
            && fs::try_exists(&existing.path).await.unwrap_or(false)
        {
            self.write_index().add_alias(key, path.to_path_buf());
            tracing::debug!(path = %path.display(), primary = %existing.path.display(), "Indexed duplicate content");
            return Ok(IngestOutcome::Duplicate(existing.clone()));
        }

        let entry = ContentEntry {
            hash: digest.hash,
            root,
            path: path.to_path_buf(),
            size: digest.size,
            last_modified: digest.modified,
            last_accessed: existing.map(|e| e.last_accessed).unwrap_or_else(UtcDateTime::now),
        };
        repository.upsert(&entry).await?;
        self.write_index().insert(entry.clone());
        Ok(IngestOutcome::Indexed(entry))
    }

    async fn persist_detached(repository: &Repository, path: &Path, detached: Detached) -> Result<()> {
        match detached {
            Detached::NotIndexed | Detached::Alias => Ok(()),
            Detached::Removed(entry) => repository.delete(entry.root, &entry.hash).await.map(|_| ()),
            Detached::Promoted(entry) => {
                tracing::debug!(from = %path.display(), to = %entry.path.display(), "Promoted duplicate copy");
                repository.upsert(&entry).await
            },
        }
    }

    /// Forget whatever is indexed at `path`. Returns whether the index
    /// changed.
    pub async fn remove_path(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let repository = self.writer.lock().await;
        let detached = self.write_index().detach(path);
        let changed = detached != Detached::NotIndexed;
        Self::persist_detached(&repository, path, detached).await?;
        Ok(changed)
    }

    /// Move a downloaded file into the cache directory under its hash and
    /// index it.
    ///
    /// The source is verified first; on a mismatch it is deleted and
    /// [`ErrorKind::HashMismatch`] returned.
    #[instrument(skip(self, source), fields(source = %source.as_ref().display()))]
    pub async fn store(&self, hash: &str, source: impl AsRef<Path>) -> Result<ContentEntry> {
        let source = source.as_ref();
        if !is_hash(hash) {
            exn::bail!(ErrorKind::InvalidData("content hash"));
        }
        let digest = digest_file(source, 1, self.settings.ingest_backoff())
            .await?
            .ok_or_raise(|| ErrorKind::Io(source.to_path_buf()))?;
        if digest.hash != hash {
            _ = fs::remove_file(source).await;
            exn::bail!(ErrorKind::HashMismatch { expected: hash.to_string(), actual: digest.hash });
        }
        let destination = self.settings.cache_directory.join(hash);
        if fs::rename(source, &destination).await.is_err() {
            // Different file system; fall back to copying.
            fs::copy(source, &destination).await.or_raise(|| ErrorKind::Io(destination.clone()))?;
            _ = fs::remove_file(source).await;
        }
        let outcome = self.index_digest(Root::Cache, &destination, digest).await?;
        let entry = match outcome {
            IngestOutcome::Indexed(entry) | IngestOutcome::Duplicate(entry) => entry,
            _ => exn::bail!(ErrorKind::Io(destination)),
        };
        self.evict().await?;
        Ok(entry)
    }

    /// Delete least recently accessed cache-directory entries until the
    /// managed cache fits its ceiling. Pinned entries and the mod directory
    /// are never touched.
    #[instrument(skip(self), fields(ceiling = self.settings.max_size_bytes))]
    pub async fn evict(&self) -> Result<EvictionReport> {
        let repository = self.writer.lock().await;
        let (mut total, mut candidates) = {
            let index = self.read_index();
            let cached: Vec<&ContentEntry> = index.entries.values().filter(|e| e.is_evictable()).collect();
            let total: u64 = cached.iter().map(|e| e.size).sum();
            let candidates: Vec<ContentEntry> = cached.into_iter().cloned().collect();
            (total, candidates)
        };
        let mut report = EvictionReport { total_bytes: total, ..EvictionReport::default() };
        if total <= self.settings.max_size_bytes {
            return Ok(report);
        }
        candidates.sort_by(|a, b| (a.last_accessed, &a.hash).cmp(&(b.last_accessed, &b.hash)));
        for entry in candidates {
            if total <= self.settings.max_size_bytes {
                break;
            }
            if self.is_pinned(&entry.hash) {
                continue;
            }
            match fs::remove_file(&entry.path).await {
                Ok(()) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => {
                    tracing::warn!(hash = %entry.hash, error = %err, "Could not evict cache file");
                    continue;
                },
            }
            repository.delete(entry.root, &entry.hash).await?;
            self.write_index().remove(&(entry.root, entry.hash.clone()));
            total -= entry.size;
            report.freed_bytes += entry.size;
            report.evicted.push(entry.hash);
        }
        report.total_bytes = total;
        if total > self.settings.max_size_bytes {
            tracing::warn!(total, "Cache still over its ceiling, remaining entries are pinned");
        } else {
            tracing::info!(evicted = report.evicted.len(), freed = report.freed_bytes, "Evicted cache entries");
        }
        Ok(report)
    }
}
