use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use time::UtcDateTime;

/// Which indexed directory a file lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Root {
    /// The user's installed mods. Never evicted.
    Mods,
    /// The managed cache directory of downloaded files.
    Cache,
}
impl Root {
    pub fn as_str(&self) -> &'static str {
        match self {
            Root::Mods => "mods",
            Root::Cache => "cache",
        }
    }
}
impl Display for Root {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}
impl FromStr for Root {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mods" => Ok(Root::Mods),
            "cache" => Ok(Root::Cache),
            _ => Err(()),
        }
    }
}

/// One indexed file: a content hash found at a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentEntry {
    /// 40-character upper-case hex SHA-1 of the file's bytes.
    pub hash: String,
    pub root: Root,
    /// Absolute path on disk.
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: UtcDateTime,
    pub last_accessed: UtcDateTime,
}
impl ContentEntry {
    pub fn is_evictable(&self) -> bool {
        self.root == Root::Cache
    }
}
