//! Upload worker: single-shot and multipart uploads with resume.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucketeer_client::{ClientError, CompletePart, ObjectStore};
use bucketeer_db::{Database, TransferStatus};
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::events::TransferEvent;
use crate::speed::SpeedMeter;
use crate::worker::{TransferSignals, WorkerFailure, backoff_delay, select_part_size};
use crate::{MAX_RETRY_ATTEMPTS, MULTIPART_THRESHOLD};

/// Drives one upload to completion, failure, pause, or cancellation.
pub struct UploadWorker {
    transfer_id: i64,
    store: Arc<dyn ObjectStore>,
    db: Database,
    signals: TransferSignals,
    events: mpsc::Sender<TransferEvent>,
    speed: SpeedMeter,
}

impl UploadWorker {
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
                "upload failed"
            );
            if let Err(db_err) = self.db.mark_failed(self.transfer_id, &failure.message).await {
                warn!(
                    transfer = self.transfer_id,
                    error = %db_err,
                    "failed to record upload failure"
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

        let local_path = PathBuf::from(&record.local_path);
        if !local_path.exists() {
            return Err(WorkerFailure::new(
                "Source file no longer exists.",
                record.local_path.clone(),
            ));
        }

        let file_size = fs::metadata(&local_path).await?.len() as i64;
        if record.total_bytes != Some(file_size) {
            self.db.set_total_bytes(self.transfer_id, file_size).await?;
        }
        self.db
            .set_status(self.transfer_id, TransferStatus::InProgress)
            .await?;

        if file_size < MULTIPART_THRESHOLD {
            self.single_upload(&local_path, &record.object_key, file_size)
                .await
        } else {
            self.multipart_upload(
                &local_path,
                &record.object_key,
                file_size,
                record.upload_id,
            )
            .await
        }
    }

    async fn single_upload(
        &mut self,
        local_path: &Path,
        key: &str,
        file_size: i64,
    ) -> Result<(), WorkerFailure> {
        let data = fs::read(local_path).await?;
        self.store.put_object(key, data.into()).await?;
        self.finish(file_size).await
    }

    async fn multipart_upload(
        &mut self,
        local_path: &Path,
        key: &str,
        file_size: i64,
        upload_id: Option<String>,
    ) -> Result<(), WorkerFailure> {
        let part_size = select_part_size(file_size);
        let num_parts = (file_size + part_size - 1) / part_size;

        let upload_id = match upload_id {
            Some(id) => {
                // Resuming: the backend is the source of truth for which
                // parts are actually durable, not the local rows.
                let confirmed = self.store.list_parts(key, &id).await?;
                for part in &confirmed {
                    self.db
                        .mark_part_completed(self.transfer_id, part.part_number as i64, &part.etag)
                        .await?;
                }
                info!(
                    transfer = self.transfer_id,
                    confirmed = confirmed.len(),
                    "resuming multipart upload"
                );
                id
            }
            None => {
                let id = self.store.create_multipart_upload(key).await?;
                self.db.set_upload_id(self.transfer_id, &id).await?;

                let mut parts = Vec::with_capacity(num_parts as usize);
                for number in 0..num_parts {
                    let byte_offset = number * part_size;
                    let size = part_size.min(file_size - byte_offset);
                    parts.push((number + 1, byte_offset, size));
                }
                self.db.create_parts(self.transfer_id, &parts).await?;
                id
            }
        };

        let pending = self.db.pending_parts(self.transfer_id).await?;
        let mut bytes_done = self.db.completed_bytes(self.transfer_id).await?;

        let mut file = fs::File::open(local_path).await?;
        for part in pending {
            if self.signals.cancel.is_cancelled() {
                self.cancel_upload(key, &upload_id).await;
                return Ok(());
            }
            if self.signals.pause.is_cancelled() {
                // No abort: the open multipart upload is what lets a later
                // resume reuse the parts already on the backend.
                self.db
                    .set_status(self.transfer_id, TransferStatus::Paused)
                    .await?;
                info!(transfer = self.transfer_id, "upload paused");
                return Ok(());
            }

            file.seek(SeekFrom::Start(part.byte_offset as u64)).await?;
            let mut data = vec![0u8; part.size as usize];
            file.read_exact(&mut data).await?;

            let etag = self
                .upload_part_with_retry(key, &upload_id, part.part_number as i32, data.into())
                .await?;

            self.db
                .mark_part_completed(self.transfer_id, part.part_number, &etag)
                .await?;
            bytes_done += part.size;
            self.db.set_transferred(self.transfer_id, bytes_done).await?;
            self.emit(TransferEvent::Progress {
                id: self.transfer_id,
                bytes_done,
                total: file_size,
            })
            .await;
            if let Some(bytes_per_sec) = self.speed.record(part.size) {
                self.emit(TransferEvent::Speed {
                    id: self.transfer_id,
                    bytes_per_sec,
                })
                .await;
            }
        }

        // Parts finished by earlier runs must be included, so the list is
        // re-read from the store rather than accumulated in this run.
        let completed = self.db.completed_parts(self.transfer_id).await?;
        let parts: Vec<CompletePart> = completed
            .iter()
            .map(|part| CompletePart {
                part_number: part.part_number as i32,
                etag: part.etag.clone().unwrap_or_default(),
            })
            .collect();
        self.store
            .complete_multipart_upload(key, &upload_id, &parts)
            .await?;
        self.finish(file_size).await
    }

    async fn upload_part_with_retry(
        &mut self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String, WorkerFailure> {
        let mut last_err: Option<ClientError> = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match self
                .store
                .upload_part(key, upload_id, part_number, data.clone())
                .await
            {
                Ok(etag) => return Ok(etag),
                Err(err) => {
                    if attempt + 1 < MAX_RETRY_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        warn!(
                            transfer = self.transfer_id,
                            part = part_number,
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs_f64(),
                            error = %err,
                            "part upload failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        let detail = last_err.map(|err| err.detail).unwrap_or_default();
        Err(WorkerFailure::new(
            format!("Upload failed after {MAX_RETRY_ATTEMPTS} attempts."),
            detail,
        ))
    }

    async fn cancel_upload(&mut self, key: &str, upload_id: &str) {
        // Best effort; a failed abort leaves an orphan for
        // cleanup_orphaned_uploads to reap later.
        if let Err(err) = self.store.abort_multipart_upload(key, upload_id).await {
            warn!(
                transfer = self.transfer_id,
                error = %err,
                "failed to abort multipart upload on cancel"
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
        info!(transfer = self.transfer_id, "upload cancelled");
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
        info!(transfer = self.transfer_id, "upload completed");
        Ok(())
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event).await;
    }
}
