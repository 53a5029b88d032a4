//! Turning a kind's file replacements into the table handed to the mod
//! service.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet};
use veneer_cache::ContentCache;
use veneer_snapshot::{FileReplacement, ReplacementTarget};

/// Game path → absolute file path (for hashes) or game path (for swaps).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemapTable {
    pub entries: BTreeMap<String, String>,
    /// Hashes referenced by the replacements that are not cached locally.
    /// Their game paths are left out of `entries`.
    pub missing: BTreeSet<String>,
}
impl RemapTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve `replacements` against the cache.
///
/// Every hit is looked up through [`ContentCache::acquire`] so it counts as
/// recently used. Callers pin the hashes beforehand so nothing found here is
/// evicted before the mod service has been told about it.
pub async fn resolve<'a>(
    cache: &ContentCache,
    replacements: impl IntoIterator<Item = &'a FileReplacement>,
) -> Result<RemapTable> {
    let mut table = RemapTable::default();
    for replacement in replacements {
        if !replacement.has_replacement() {
            continue;
        }
        let target = match &replacement.target {
            ReplacementTarget::Swap(path) => path.clone(),
            ReplacementTarget::Hash(hash) => match cache.acquire(hash).await.or_raise(|| ErrorKind::Cache)? {
                Some(entry) => entry.path.to_string_lossy().into_owned(),
                None => {
                    table.missing.insert(hash.clone());
                    continue;
                },
            },
        };
        for game_path in &replacement.game_paths {
            table.entries.insert(game_path.clone(), target.clone());
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Fixture;

    #[tokio::test]
    async fn test_hits_misses_and_swaps() {
        let fixture = Fixture::new().await;
        let cached = fixture.cache_file(b"skin texture").await;
        let absent = "C".repeat(40);
        let replacements = [
            FileReplacement::new(["chara/skin.tex", "chara/skin_b.tex"], ReplacementTarget::Hash(cached.clone())),
            FileReplacement::new(["chara/gone.mdl"], ReplacementTarget::Hash(absent.clone())),
            FileReplacement::new(["chara/sword.mdl"], ReplacementTarget::Swap("chara/axe.mdl".into())),
            FileReplacement::new(["chara/same.mdl"], ReplacementTarget::Swap("chara/same.mdl".into())),
        ];

        let table = resolve(&fixture.cache, &replacements).await.unwrap();
        let path = fixture.cache.lookup(&cached).unwrap().path.to_string_lossy().into_owned();
        assert_eq!(
            table.entries,
            BTreeMap::from([
                ("chara/skin.tex".to_string(), path.clone()),
                ("chara/skin_b.tex".to_string(), path),
                ("chara/sword.mdl".to_string(), "chara/axe.mdl".to_string()),
            ])
        );
        assert_eq!(table.missing, BTreeSet::from([absent]));
    }
}
