use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Hashes the server refused, remembered for a cooldown so identical
/// requests don't ask again.
#[derive(Debug)]
pub struct ForbiddenRegistry {
    cooldown: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl ForbiddenRegistry {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, entries: Mutex::new(HashMap::new()) }
    }

    pub fn record(&self, hash: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(hash.into(), Instant::now());
    }

    /// Whether `hash` was recorded within the cooldown.
    pub fn contains(&self, hash: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(hash) {
            Some(at) if at.elapsed() < self.cooldown => true,
            Some(_) => {
                entries.remove(hash);
                false
            },
            None => false,
        }
    }

    /// Split `hashes` into (still forbidden, everything else).
    pub fn partition<'a>(&self, hashes: impl IntoIterator<Item = &'a String>) -> (BTreeSet<String>, BTreeSet<String>) {
        hashes.into_iter().cloned().partition(|hash| self.contains(hash))
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|at| at.elapsed() < self.cooldown).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let registry = ForbiddenRegistry::new(Duration::from_secs(60));
        registry.record("C");
        assert!(registry.contains("C"));
        assert!(!registry.contains("D"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(registry.contains("C"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!registry.contains("C"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_partition() {
        let registry = ForbiddenRegistry::new(Duration::from_secs(60));
        registry.record("B");
        let hashes = ["A".to_string(), "B".to_string(), "C".to_string()];
        let (forbidden, allowed) = registry.partition(&hashes);
        assert_eq!(forbidden, BTreeSet::from(["B".to_string()]));
        assert_eq!(allowed.len(), 2);
    }
}
