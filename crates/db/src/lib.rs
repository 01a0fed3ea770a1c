//! Persistent transfer store for Bucketeer.
//!
//! A SQLite database holding the durable record of every transfer, the
//! per-part completion state of multipart uploads, and a small key-value
//! preference store. Workers and the engine share one [`Database`] handle;
//! the pool serializes writes.

mod transfers;

pub use transfers::{
    Direction, PartStatus, TransferPart, TransferRecord, TransferStatus,
};

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Embedded migrations, applied in order and tracked in `schema_version`.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

/// Handle to the SQLite store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the database at `path` and applies any
    /// pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(path = %path.display(), "database initialized");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version \
             (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
        )
        .execute(&self.pool)
        .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        let current = current.unwrap_or(0);

        for &(version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            debug!(version, "applying migration");
            for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement).execute(&self.pool).await?;
            }
            sqlx::query("INSERT OR REPLACE INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reads a preference value.
    pub async fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Upserts a preference value.
    pub async fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO preferences (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("store.db")).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn open_creates_parent_dirs_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/store.db");
        let db = Database::open(&path).await.unwrap();
        assert!(path.exists());

        // Re-opening applies no further migrations and succeeds.
        drop(db);
        Database::open(&path).await.unwrap();
    }

    #[tokio::test]
    async fn preference_round_trip() {
        let (_dir, db) = open_temp().await;
        assert_eq!(db.get_pref("last_bucket").await.unwrap(), None);

        db.set_pref("last_bucket", "media").await.unwrap();
        assert_eq!(
            db.get_pref("last_bucket").await.unwrap().as_deref(),
            Some("media")
        );

        db.set_pref("last_bucket", "logs").await.unwrap();
        assert_eq!(
            db.get_pref("last_bucket").await.unwrap().as_deref(),
            Some("logs")
        );
    }
}
