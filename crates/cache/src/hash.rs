//! Content hashing.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::{OffsetDateTime, UtcDateTime};

const BUFFER_SIZE: usize = 64 * 1024;
pub(crate) const HASH_LENGTH: usize = 40;

/// Upper-case hex SHA-1 of `data`.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

/// Whether `value` is shaped like a content hash (40 upper-case hex digits).
pub fn is_hash(value: &str) -> bool {
    value.len() == HASH_LENGTH && value.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FileDigest {
    pub(crate) hash: String,
    pub(crate) size: u64,
    pub(crate) modified: UtcDateTime,
}

fn digest_blocking(path: &Path) -> std::io::Result<FileDigest> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        size += read as u64;
        hasher.update(&buffer[..read]);
    }
    let modified = metadata.modified().map(|m| OffsetDateTime::from(m).to_utc()).unwrap_or_else(|_| UtcDateTime::now());
    Ok(FileDigest { hash: hex::encode_upper(hasher.finalize()), size, modified })
}

/// Hash a file off the async runtime.
///
/// Files still being written by another process fail to open or read; those
/// are retried `attempts` times with a fixed `backoff`. A file that does not
/// exist (any more) yields `None`.
pub(crate) async fn digest_file(path: &Path, attempts: u32, backoff: Duration) -> Result<Option<FileDigest>> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let owned: PathBuf = path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || digest_blocking(&owned))
            .await
            .or_raise(|| ErrorKind::Io(path.to_path_buf()))?;
        match outcome {
            Ok(digest) => return Ok(Some(digest)),
            Err(error) if error.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(error) if attempt < attempts => {
                tracing::debug!(path = %path.display(), attempt, %error, "File not readable yet, retrying");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            },
            Err(error) => return Err(error).or_raise(|| ErrorKind::Io(path.to_path_buf())),
        }
    }
}
