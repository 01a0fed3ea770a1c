//! Transfer and part records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Database, Result};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// Transfer lifecycle states.
///
/// `queued → in_progress → {completed | failed | cancelled | paused}`;
/// `paused` returns to `queued` on an explicit resume. `completed`,
/// `failed`, and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Completion state of one multipart part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    Completed,
}

/// One upload or download of exactly one object.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransferRecord {
    pub id: i64,
    pub bucket: String,
    pub direction: Direction,
    pub local_path: String,
    pub object_key: String,
    pub status: TransferStatus,
    pub total_bytes: Option<i64>,
    pub transferred: i64,
    pub upload_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One chunk of a multipart upload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransferPart {
    pub transfer_id: i64,
    pub part_number: i64,
    pub byte_offset: i64,
    pub size: i64,
    pub status: PartStatus,
    pub etag: Option<String>,
}

impl Database {
    /// Creates a queued transfer record and returns its id.
    pub async fn create_transfer(
        &self,
        bucket: &str,
        direction: Direction,
        local_path: &str,
        object_key: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO transfers (bucket, direction, local_path, object_key, status, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket)
        .bind(direction)
        .bind(local_path)
        .bind(object_key)
        .bind(TransferStatus::Queued)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Option<TransferRecord>> {
        let record = sqlx::query_as::<_, TransferRecord>("SELECT * FROM transfers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(record)
    }

    pub async fn set_status(&self, id: i64, status: TransferStatus) -> Result<()> {
        sqlx::query("UPDATE transfers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Marks a transfer failed with a user-facing error message.
    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transfers SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TransferStatus::Failed)
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_total_bytes(&self, id: i64, total: i64) -> Result<()> {
        sqlx::query("UPDATE transfers SET total_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(total)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_transferred(&self, id: i64, bytes: i64) -> Result<()> {
        sqlx::query("UPDATE transfers SET transferred = ?, updated_at = ? WHERE id = ?")
            .bind(bytes)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_upload_id(&self, id: i64, upload_id: &str) -> Result<()> {
        sqlx::query("UPDATE transfers SET upload_id = ?, updated_at = ? WHERE id = ?")
            .bind(upload_id)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Marks a transfer completed with its final byte count.
    pub async fn complete_transfer(&self, id: i64, total: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transfers SET status = ?, transferred = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TransferStatus::Completed)
        .bind(total)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Marks a transfer paused, recording how far it got.
    pub async fn pause_transfer(&self, id: i64, transferred: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transfers SET status = ?, transferred = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TransferStatus::Paused)
        .bind(transferred)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Resets a transfer for a fresh attempt: queued, retry count and error
    /// message cleared.
    pub async fn reset_for_retry(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transfers SET status = ?, retry_count = 0, error_message = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(TransferStatus::Queued)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Bulk part creation for a freshly initiated multipart upload.
    ///
    /// INSERT OR IGNORE keeps this idempotent: a crash between initiating
    /// the upload and finishing row creation never duplicates parts.
    pub async fn create_parts(
        &self,
        transfer_id: i64,
        parts: &[(i64, i64, i64)],
    ) -> Result<()> {
        for &(part_number, byte_offset, size) in parts {
            sqlx::query(
                "INSERT OR IGNORE INTO transfer_parts \
                 (transfer_id, part_number, byte_offset, size) VALUES (?, ?, ?, ?)",
            )
            .bind(transfer_id)
            .bind(part_number)
            .bind(byte_offset)
            .bind(size)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn mark_part_completed(
        &self,
        transfer_id: i64,
        part_number: i64,
        etag: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transfer_parts SET status = ?, etag = ? \
             WHERE transfer_id = ? AND part_number = ?",
        )
        .bind(PartStatus::Completed)
        .bind(etag)
        .bind(transfer_id)
        .bind(part_number)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Parts not yet confirmed durable, in ascending part order.
    pub async fn pending_parts(&self, transfer_id: i64) -> Result<Vec<TransferPart>> {
        let parts = sqlx::query_as::<_, TransferPart>(
            "SELECT * FROM transfer_parts WHERE transfer_id = ? AND status != 'completed' \
             ORDER BY part_number",
        )
        .bind(transfer_id)
        .fetch_all(self.pool())
        .await?;
        Ok(parts)
    }

    /// Completed parts in ascending part order, as required by the
    /// multipart completion call.
    pub async fn completed_parts(&self, transfer_id: i64) -> Result<Vec<TransferPart>> {
        let parts = sqlx::query_as::<_, TransferPart>(
            "SELECT * FROM transfer_parts WHERE transfer_id = ? AND status = 'completed' \
             ORDER BY part_number",
        )
        .bind(transfer_id)
        .fetch_all(self.pool())
        .await?;
        Ok(parts)
    }

    /// Total bytes across completed parts.
    pub async fn completed_bytes(&self, transfer_id: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM transfer_parts \
             WHERE transfer_id = ? AND status = 'completed'",
        )
        .bind(transfer_id)
        .fetch_one(self.pool())
        .await?;
        Ok(total)
    }

    /// Transfers a restarted app should pick back up.
    pub async fn restorable_transfers(&self) -> Result<Vec<TransferRecord>> {
        let records = sqlx::query_as::<_, TransferRecord>(
            "SELECT * FROM transfers WHERE status IN ('queued', 'in_progress', 'paused') \
             ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Queued transfer ids for a bucket, FIFO by creation.
    pub async fn next_queued(&self, bucket: &str) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM transfers WHERE status = 'queued' AND bucket = ? \
             ORDER BY created_at, id",
        )
        .bind(bucket)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Paused transfer ids for a bucket.
    pub async fn paused_transfers(&self, bucket: &str) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM transfers WHERE status = 'paused' AND bucket = ? \
             ORDER BY created_at, id",
        )
        .bind(bucket)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Upload ids the store knows about, for orphan reconciliation.
    pub async fn known_upload_ids(&self) -> Result<Vec<String>> {
        let ids =
            sqlx::query_scalar("SELECT upload_id FROM transfers WHERE upload_id IS NOT NULL")
                .fetch_all(self.pool())
                .await?;
        Ok(ids)
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
    async fn create_and_read_transfer() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Upload, "/tmp/a.bin", "docs/a.bin")
            .await
            .unwrap();

        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.bucket, "media");
        assert_eq!(record.direction, Direction::Upload);
        assert_eq!(record.status, TransferStatus::Queued);
        assert_eq!(record.total_bytes, None);
        assert_eq!(record.transferred, 0);
        assert_eq!(record.upload_id, None);
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn missing_transfer_is_none() {
        let (_dir, db) = open_temp().await;
        assert!(db.get_transfer(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_progress_updates() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Download, "/tmp/a.bin", "a.bin")
            .await
            .unwrap();

        db.set_status(id, TransferStatus::InProgress).await.unwrap();
        db.set_total_bytes(id, 4096).await.unwrap();
        db.set_transferred(id, 1024).await.unwrap();

        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(record.total_bytes, Some(4096));
        assert_eq!(record.transferred, 1024);

        db.complete_transfer(id, 4096).await.unwrap();
        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.transferred, 4096);
        assert!(record.status.is_terminal());
    }

    #[tokio::test]
    async fn mark_failed_records_message() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Upload, "/tmp/a.bin", "a.bin")
            .await
            .unwrap();

        db.mark_failed(id, "Source file no longer exists.").await.unwrap();
        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("Source file no longer exists.")
        );

        db.reset_for_retry(id).await.unwrap();
        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Queued);
        assert_eq!(record.error_message, None);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn part_creation_is_idempotent() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Upload, "/tmp/a.bin", "a.bin")
            .await
            .unwrap();

        let parts = vec![(1, 0, 100), (2, 100, 50)];
        db.create_parts(id, &parts).await.unwrap();
        // A restarted worker re-creating the rows must not duplicate them.
        db.create_parts(id, &parts).await.unwrap();

        let pending = db.pending_parts(id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].part_number, 1);
        assert_eq!(pending[0].byte_offset, 0);
        assert_eq!(pending[0].size, 100);
        assert_eq!(pending[1].part_number, 2);
    }

    #[tokio::test]
    async fn part_completion_and_byte_sums() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Upload, "/tmp/a.bin", "a.bin")
            .await
            .unwrap();
        db.create_parts(id, &[(1, 0, 100), (2, 100, 50), (3, 150, 25)])
            .await
            .unwrap();

        db.mark_part_completed(id, 1, "etag-1").await.unwrap();
        db.mark_part_completed(id, 3, "etag-3").await.unwrap();

        assert_eq!(db.completed_bytes(id).await.unwrap(), 125);

        let pending = db.pending_parts(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].part_number, 2);

        let completed = db.completed_parts(id).await.unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].part_number, 1);
        assert_eq!(completed[0].etag.as_deref(), Some("etag-1"));
        assert_eq!(completed[1].part_number, 3);
    }

    #[tokio::test]
    async fn queue_is_fifo_and_bucket_scoped() {
        let (_dir, db) = open_temp().await;
        let first = db
            .create_transfer("media", Direction::Upload, "/tmp/a", "a")
            .await
            .unwrap();
        let second = db
            .create_transfer("media", Direction::Upload, "/tmp/b", "b")
            .await
            .unwrap();
        let other = db
            .create_transfer("logs", Direction::Upload, "/tmp/c", "c")
            .await
            .unwrap();

        let queued = db.next_queued("media").await.unwrap();
        assert_eq!(queued, vec![first, second]);
        assert!(!queued.contains(&other));
    }

    #[tokio::test]
    async fn restorable_and_paused_queries() {
        let (_dir, db) = open_temp().await;
        let queued = db
            .create_transfer("media", Direction::Upload, "/tmp/a", "a")
            .await
            .unwrap();
        let running = db
            .create_transfer("media", Direction::Upload, "/tmp/b", "b")
            .await
            .unwrap();
        let paused = db
            .create_transfer("media", Direction::Download, "/tmp/c", "c")
            .await
            .unwrap();
        let done = db
            .create_transfer("media", Direction::Upload, "/tmp/d", "d")
            .await
            .unwrap();

        db.set_status(running, TransferStatus::InProgress).await.unwrap();
        db.set_status(paused, TransferStatus::Paused).await.unwrap();
        db.complete_transfer(done, 10).await.unwrap();

        let restorable: Vec<i64> = db
            .restorable_transfers()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(restorable, vec![queued, running, paused]);

        assert_eq!(db.paused_transfers("media").await.unwrap(), vec![paused]);
        assert!(db.paused_transfers("logs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_upload_ids_skips_null() {
        let (_dir, db) = open_temp().await;
        let with_upload = db
            .create_transfer("media", Direction::Upload, "/tmp/a", "a")
            .await
            .unwrap();
        db.create_transfer("media", Direction::Upload, "/tmp/b", "b")
            .await
            .unwrap();

        db.set_upload_id(with_upload, "upload-123").await.unwrap();

        assert_eq!(db.known_upload_ids().await.unwrap(), vec!["upload-123"]);
    }

    #[tokio::test]
    async fn pause_transfer_records_offset() {
        let (_dir, db) = open_temp().await;
        let id = db
            .create_transfer("media", Direction::Download, "/tmp/a", "a")
            .await
            .unwrap();

        db.pause_transfer(id, 2048).await.unwrap();
        let record = db.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Paused);
        assert_eq!(record.transferred, 2048);
        assert!(!record.status.is_terminal());
    }
}
