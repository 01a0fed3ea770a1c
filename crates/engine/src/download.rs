//! Download worker: single-shot and ranged downloads with resume.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucketeer_client::{ClientError, ObjectStore};
use bucketeer_db::{Database, TransferStatus};
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::events::TransferEvent;
use crate::speed::SpeedMeter;
use crate::worker::{TransferSignals, WorkerFailure, backoff_delay};
use crate::{DOWNLOAD_CHUNK_SIZE, MAX_RETRY_ATTEMPTS, MULTIPART_THRESHOLD};

/// Sibling temp file used for resumable ranged downloads.
fn temp_download_path(final_path: &Path, transfer_id: i64) -> PathBuf {
    final_path.with_file_name(format!(".bucketeer-download-{transfer_id}.tmp"))
}

/// Drives one download to completion, failure, pause, or cancellation.
pub struct DownloadWorker {
    transfer_id: i64,
    store: Arc<dyn ObjectStore>,
    db: Database,
    signals: TransferSignals,
    events: mpsc::Sender<TransferEvent>,
    speed: SpeedMeter,
}

impl DownloadWorker {
    pub fn new(
        transfer_id: i64,
        store: Arc<dyn ObjectStore>,
        db: Database,
        signals: TransferSignals,
        events: mpsc::Sender<TransferEvent>,
    ) -> Self {
        Self {
            transfer_id,
            store,
            db,
            signals,
            events,
            speed: SpeedMeter::default(),
        }
    }

    /// Runs the transfer. Never lets an error escape: any failure becomes a
    /// `failed` status write plus one [`TransferEvent::Failed`].
    pub async fn run(mut self) {
        if let Err(failure) = self.execute().await {
            warn!(
                transfer = self.transfer_id,
                error = %failure.message,
                "download failed"
            );
            if let Err(db_err) = self.db.mark_failed(self.transfer_id, &failure.message).await {
                warn!(
                    transfer = self.transfer_id,
                    error = %db_err,
                    "failed to record download failure"
                );
            }
            self.emit(TransferEvent::Failed {
                id: self.transfer_id,
                message: failure.message,
                detail: failure.detail,
            })
            .await;
        }
    }

    async fn execute(&mut self) -> Result<(), WorkerFailure> {
        let Some(record) = self.db.get_transfer(self.transfer_id).await? else {
            return Err(WorkerFailure::new("Transfer record not found.", String::new()));
        };

        let final_path = PathBuf::from(&record.local_path);
        if let Some(dir) = final_path.parent().filter(|p| !p.as_os_str().is_empty())
            && !dir.exists()
        {
            return Err(WorkerFailure::new(
                "Destination directory does not exist.",
                dir.display().to_string(),
            ));
        }

        self.db
            .set_status(self.transfer_id, TransferStatus::InProgress)
            .await?;

        let head = self.store.head_object(&record.object_key).await?;
        let total = head.size.unwrap_or(0);
        self.db.set_total_bytes(self.transfer_id, total).await?;

        let temp_path = temp_download_path(&final_path, self.transfer_id);
        if total < MULTIPART_THRESHOLD {
            self.single_download(&record.object_key, &final_path, &temp_path, total)
                .await
        } else {
            self.ranged_download(&record.object_key, &final_path, &temp_path, total)
                .await
        }
    }

    async fn single_download(
        &mut self,
        key: &str,
        final_path: &Path,
        temp_path: &Path,
        total: i64,
    ) -> Result<(), WorkerFailure> {
        let data = self.store.get_object(key, None).await?;
        fs::write(temp_path, &data).await?;
        fs::rename(temp_path, final_path).await?;
        self.finish(total).await
    }

    async fn ranged_download(
        &mut self,
        key: &str,
        final_path: &Path,
        temp_path: &Path,
        total: i64,
    ) -> Result<(), WorkerFailure> {
        // Ranged chunks are appended strictly in order, so an existing temp
        // file's length is the resume offset.
        let mut offset: i64 = 0;
        if let Ok(meta) = fs::metadata(temp_path).await {
            offset = meta.len() as i64;
            self.db.set_transferred(self.transfer_id, offset).await?;
            info!(transfer = self.transfer_id, offset, "resuming download");
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(temp_path)
            .await?;

        while offset < total {
            if self.signals.cancel.is_cancelled() {
                drop(file);
                self.cancel_download(temp_path).await;
                return Ok(());
            }
            if self.signals.pause.is_cancelled() {
                // Temp file is preserved; its length is the resume offset.
                self.db.pause_transfer(self.transfer_id, offset).await?;
                info!(transfer = self.transfer_id, offset, "download paused");
                return Ok(());
            }

            let end = (offset + DOWNLOAD_CHUNK_SIZE - 1).min(total - 1);
            let data = self
                .download_chunk_with_retry(key, offset as u64, end as u64)
                .await?;
            file.write_all(&data).await?;
            offset += data.len() as i64;

            self.db.set_transferred(self.transfer_id, offset).await?;
            self.emit(TransferEvent::Progress {
                id: self.transfer_id,
                bytes_done: offset,
                total,
            })
            .await;
            if let Some(bytes_per_sec) = self.speed.record(data.len() as i64) {
                self.emit(TransferEvent::Speed {
                    id: self.transfer_id,
                    bytes_per_sec,
                })
                .await;
            }
        }
        file.flush().await?;
        drop(file);

        let actual = fs::metadata(temp_path).await?.len() as i64;
        if actual != total {
            // Hard failure, never retried; the temp file stays for
            // inspection and a fresh attempt starts over.
            return Err(WorkerFailure::new(
                format!("Size mismatch: expected {total}, got {actual}"),
                temp_path.display().to_string(),
            ));
        }

        fs::rename(temp_path, final_path).await?;
        self.finish(total).await
    }

    async fn download_chunk_with_retry(
        &mut self,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, WorkerFailure> {
        let mut last_err: Option<ClientError> = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match self.store.get_object(key, Some((start, end))).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    if attempt + 1 < MAX_RETRY_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        warn!(
                            transfer = self.transfer_id,
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs_f64(),
                            error = %err,
                            "chunk download failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        let detail = last_err.map(|err| err.detail).unwrap_or_default();
        Err(WorkerFailure::new(
            format!("Download failed after {MAX_RETRY_ATTEMPTS} attempts."),
            detail,
        ))
    }

    async fn cancel_download(&mut self, temp_path: &Path) {
        if let Err(err) = fs::remove_file(temp_path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                transfer = self.transfer_id,
                error = %err,
                "failed to remove temp file on cancel"
            );
        }
        if let Err(err) = self
            .db
            .set_status(self.transfer_id, TransferStatus::Cancelled)
            .await
        {
            warn!(
                transfer = self.transfer_id,
                error = %err,
                "failed to record cancellation"
            );
        }
        info!(transfer = self.transfer_id, "download cancelled");
    }

    async fn finish(&mut self, total: i64) -> Result<(), WorkerFailure> {
        self.db.complete_transfer(self.transfer_id, total).await?;
        self.emit(TransferEvent::Progress {
            id: self.transfer_id,
            bytes_done: total,
            total,
        })
        .await;
        self.emit(TransferEvent::Finished {
            id: self.transfer_id,
        })
        .await;
        info!(transfer = self.transfer_id, "download completed");
        Ok(())
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event).await;
    }
}
