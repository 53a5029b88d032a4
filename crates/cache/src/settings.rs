use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Asset extensions the mod directory scan picks up by default.
pub const DEFAULT_ASSET_EXTENSIONS: &[&str] = &[
    "mdl", "tex", "mtrl", "tmb", "pap", "avfx", "atex", "sklb", "eid", "phyb", "pbd", "scd", "skp", "shpk",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Root of the user's installed mods. `None` disables indexing of it.
    pub mod_directory: Option<PathBuf>,
    /// Flat directory of downloaded files, named by content hash.
    pub cache_directory: PathBuf,
    /// Index database; a hidden `.index.sqlite` in the cache directory when
    /// unset, so scans skip it.
    pub database_path: Option<PathBuf>,
    /// Ceiling on the summed size of the managed cache directory.
    pub max_size_bytes: u64,
    /// Parallel hashing workers during rescans and watcher reconciliation.
    pub scan_workers: usize,
    /// Quiet period after the last watcher event before dirty paths are
    /// reconciled.
    pub debounce_ms: u64,
    /// Attempts at opening a file that is still being written.
    pub ingest_attempts: u32,
    pub ingest_backoff_ms: u64,
    /// Extensions (without dot, lower-case) indexed in the mod directory.
    pub asset_extensions: Vec<String>,
}
impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            mod_directory: None,
            cache_directory: PathBuf::new(),
            database_path: None,
            max_size_bytes: 20 * 1024 * 1024 * 1024,
            scan_workers: 4,
            debounce_ms: 1000,
            ingest_attempts: 10,
            ingest_backoff_ms: 250,
            asset_extensions: DEFAULT_ASSET_EXTENSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}
impl CacheSettings {
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| self.cache_directory.join(".index.sqlite"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ingest_backoff(&self) -> Duration {
        Duration::from_millis(self.ingest_backoff_ms)
    }

    /// Whether a mod directory file with this extension is an asset.
    pub fn is_asset_extension(&self, extension: &str) -> bool {
        self.asset_extensions.iter().any(|e| e.eq_ignore_ascii_case(extension))
    }
}
