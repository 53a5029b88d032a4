//! File system watcher feeding debounced reconciliation.

use crate::CacheHandle;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A burst that never goes quiet is still flushed after this many debounce
/// windows.
const MAX_DEBOUNCE_WINDOWS: u32 = 10;

/// A running watcher. Dropping the handle stops watching.
pub struct WatchHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}
impl WatchHandle {
    /// Stop watching and wait for any in-progress reconciliation to finish.
    pub async fn stop(self) {
        self.token.cancel();
        _ = self.task.await;
    }
}

/// Collect paths until `debounce` passes without a new one (or the burst
/// has lasted `MAX_DEBOUNCE_WINDOWS` windows). `None` when the channel closed
/// or the token was cancelled before anything arrived.
async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
    token: &CancellationToken,
) -> Option<BTreeSet<PathBuf>> {
    let first = tokio::select! {
        _ = token.cancelled() => return None,
        path = rx.recv() => path?,
    };
    let mut dirty = BTreeSet::from([first]);
    let cap = Instant::now() + debounce * MAX_DEBOUNCE_WINDOWS;
    loop {
        let quiet = (Instant::now() + debounce).min(cap);
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep_until(quiet) => return Some(dirty),
            path = rx.recv() => match path {
                Some(path) => { dirty.insert(path); },
                None => return Some(dirty),
            },
        }
    }
}

fn is_relevant(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any)
}

impl crate::ContentCache {
    /// Watch the mod directory (recursively) and the cache directory for
    /// changes and reconcile dirty paths after the debounce window.
    ///
    /// Reconciliation failures are logged; the next event or rescan retries.
    pub fn watch(self: &CacheHandle, token: CancellationToken) -> Result<WatchHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) if is_relevant(&event) => {
                for path in event.paths {
                    _ = tx.send(path);
                }
            },
            Ok(_) => {},
            Err(err) => tracing::warn!(error = %err, "File watcher error"),
        })
        .or_raise(|| ErrorKind::Watch)?;

        watcher
            .watch(&self.settings.cache_directory, RecursiveMode::NonRecursive)
            .or_raise(|| ErrorKind::Watch)?;
        if let Some(mods) = &self.settings.mod_directory {
            watcher.watch(mods, RecursiveMode::Recursive).or_raise(|| ErrorKind::Watch)?;
        }

        let cache = self.clone();
        let debounce = self.settings.debounce();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            tracing::info!(?debounce, "Watching for file changes");
            while let Some(dirty) = next_batch(&mut rx, debounce, &task_token).await {
                let dirty: BTreeSet<PathBuf> = dirty.into_iter().filter(|p| cache.is_watched_path(p)).collect();
                if dirty.is_empty() {
                    continue;
                }
                match cache.reconcile(dirty).await {
                    Ok(report) => tracing::debug!(?report, "Reconciled changed files"),
                    Err(err) => tracing::warn!(error = %*err, "Reconciling changed files failed"),
                }
            }
            tracing::debug!("File watcher stopped");
        });
        Ok(WatchHandle { token, task, _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;
    use crate::store::tests::fixture;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        for i in 0..5 {
            tx.send(PathBuf::from(format!("/mods/{i}.tex"))).unwrap();
        }
        tx.send(PathBuf::from("/mods/0.tex")).unwrap();
        let batch = next_batch(&mut rx, Duration::from_secs(1), &token).await.unwrap();
        assert_eq!(batch.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_burst_is_capped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let sender = tokio::spawn(async move {
            for i in 0.. {
                if tx.send(PathBuf::from(format!("/mods/{i}.tex"))).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        let started = Instant::now();
        let batch = next_batch(&mut rx, Duration::from_secs(1), &token).await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(10));
        assert!(batch.len() >= 19);
        drop(rx);
        sender.abort();
    }

    #[tokio::test]
    async fn test_cancelled_before_events() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        token.cancel();
        assert!(next_batch(&mut rx, Duration::from_secs(1), &token).await.is_none());
    }

    #[tokio::test]
    async fn test_watcher_indexes_new_file() {
        let f = fixture().await;
        let cache = Arc::new(f.cache);
        let handle = cache.watch(CancellationToken::new()).unwrap();

        let data = b"dropped in by a mod installer";
        let path = f.dir.path().join("mods").join("fresh.tex");
        std::fs::write(&path, data).unwrap();

        let hash = hash_bytes(data);
        let mut found = false;
        for _ in 0..100 {
            if cache.lookup(&hash).is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.stop().await;
        assert!(found, "watcher never indexed the new file");
    }
}
