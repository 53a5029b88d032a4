//! Persistence of index entries.
//!
//! Every write goes through here, and the [`ContentCache`](crate::ContentCache)
//! holds the only `Repository` behind a mutex, making it the single writer.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{ContentEntry, EntryRow, Root, row::to_nanos};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;

#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    /// Record `entry`, replacing any other entry previously recorded at the
    /// same path.
    pub async fn upsert(&self, entry: &ContentEntry) -> Result<()> {
        let row = EntryRow::try_from(entry)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/delete_path_conflicts.sql"))
            .bind(&row.path)
            .bind(&row.root)
            .bind(&row.hash)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(row.root)
            .bind(row.hash)
            .bind(row.path)
            .bind(row.size)
            .bind(row.last_modified)
            .bind(row.last_accessed)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn delete(&self, root: Root, hash: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(root.as_str())
            .bind(hash)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Move the access time forward. Never moves it backwards.
    pub async fn touch(&self, root: Root, hash: &str, at: UtcDateTime) -> Result<()> {
        sqlx::query(include_str!("../queries/touch_entry.sql"))
            .bind(to_nanos(at)?)
            .bind(root.as_str())
            .bind(hash)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ContentEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/list_entries.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(ContentEntry::try_from).collect()
    }
}
