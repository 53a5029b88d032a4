use crate::error::{Error, ErrorKind};
use crate::models::{ContentEntry, Root};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use time::UtcDateTime;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) root: String,
    pub(crate) hash: String,
    pub(crate) path: String,
    pub(crate) size: i64,
    pub(crate) last_modified: i64,
    pub(crate) last_accessed: i64,
}

pub(crate) fn to_nanos(at: UtcDateTime) -> Result<i64, Error> {
    i64::try_from(at.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

fn from_nanos(nanos: i64, what: &'static str) -> Result<UtcDateTime, Error> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData(what))
}

impl TryFrom<&ContentEntry> for EntryRow {
    type Error = Error;
    fn try_from(entry: &ContentEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            root: entry.root.as_str().to_string(),
            hash: entry.hash.clone(),
            path: entry.path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string(),
            size: i64::try_from(entry.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            last_modified: to_nanos(entry.last_modified)?,
            last_accessed: to_nanos(entry.last_accessed)?,
        })
    }
}
impl TryFrom<EntryRow> for ContentEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            root: row.root.parse::<Root>().ok().ok_or_raise(|| ErrorKind::InvalidData("root"))?,
            hash: row.hash,
            path: PathBuf::from(row.path),
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            last_modified: from_nanos(row.last_modified, "modification date")?,
            last_accessed: from_nanos(row.last_accessed, "access date")?,
        })
    }
}
