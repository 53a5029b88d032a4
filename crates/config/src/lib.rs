//! Layered configuration.
//!
//! Sources, each overriding the ones before it:
//! 1. built-in defaults,
//! 2. one TOML, YAML or JSON file: the path given explicitly, otherwise
//!    `veneer.toml` in the platform's configuration directory if it exists,
//! 3. environment variables prefixed with `VENEER_`, with `__` separating a
//!    section from its key (`VENEER_TRANSFER__SERVER_URL`).
//!
//! Every section is the settings struct of the crate it configures, so
//! those crates stay usable without this one.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::instrument;
use veneer_apply::ApplySettings;
use veneer_cache::CacheSettings;
use veneer_snapshot::SnapshotSettings;
use veneer_transfer::TransferSettings;

pub const ENV_PREFIX: &str = "VENEER_";
pub const FILE_NAME: &str = "veneer.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "veneer")
}

/// Where the configuration file is looked for when none is given.
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(FILE_NAME))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSettings,
    pub transfer: TransferSettings,
    pub snapshot: SnapshotSettings,
    pub apply: ApplySettings,
}

impl Default for Config {
    fn default() -> Self {
        // Left empty (and rejected by validation) on platforms without a
        // home directory.
        let cache_directory = project_dirs().map(|dirs| dirs.cache_dir().to_path_buf()).unwrap_or_default();
        Self {
            cache: CacheSettings { cache_directory, ..CacheSettings::default() },
            transfer: TransferSettings::default(),
            snapshot: SnapshotSettings::default(),
            apply: ApplySettings::default(),
        }
    }
}

impl Config {
    /// The layered sources, not yet extracted.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file.map(Path::to_path_buf).or_else(default_path) {
            figment = match file.extension().and_then(|extension| extension.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate. An explicit `file` has to exist; the default one
    /// is optional.
    #[instrument]
    pub fn load(file: Option<&Path>) -> Result<Self> {
        if let Some(file) = file
            && !file.is_file()
        {
            exn::bail!(ErrorKind::NotFound(file.to_path_buf()));
        }
        let config: Config = Self::figment(file).extract().or_raise(|| ErrorKind::Malformed)?;
        config.validate()?;
        tracing::debug!(cache = %config.cache.cache_directory.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        let paths = [
            ("cache.cache_directory", Some(&cache.cache_directory)),
            ("cache.mod_directory", cache.mod_directory.as_ref()),
            ("cache.database_path", cache.database_path.as_ref()),
        ];
        for (key, path) in paths {
            if let Some(path) = path
                && !path.is_absolute()
            {
                exn::bail!(ErrorKind::Invalid(format!("{key} must be an absolute path, got {:?}", path.display())));
            }
        }
        if cache.scan_workers == 0 {
            exn::bail!(ErrorKind::Invalid("cache.scan_workers must be at least 1".to_string()));
        }
        if cache.max_size_bytes == 0 {
            exn::bail!(ErrorKind::Invalid("cache.max_size_bytes must not be zero".to_string()));
        }
        Ok(())
    }
}
