//! Transfer engine: queue admission, pause/cancel signaling, crash
//! recovery, and orphaned multipart cleanup.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bucketeer_client::ObjectStore;
use bucketeer_db::{Database, Direction, TransferStatus};
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::ORPHAN_UPLOAD_GRACE_HOURS;
use crate::download::DownloadWorker;
use crate::events::TransferEvent;
use crate::upload::UploadWorker;
use crate::worker::TransferSignals;

/// Manages the transfer queue and worker pool for one bucket.
///
/// At most `max_concurrent` transfers run at once; further enqueues wait on
/// a fair semaphore, so admission is FIFO. Pause and cancel are cooperative:
/// the worker observes its signals at the next part/chunk boundary, and
/// callers must not assume immediate effect.
pub struct TransferEngine {
    shared: Arc<EngineShared>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

struct EngineShared {
    store: Arc<dyn ObjectStore>,
    db: Database,
    bucket: String,
    permits: Arc<Semaphore>,
    events_tx: mpsc::Sender<TransferEvent>,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    active: HashSet<i64>,
    signals: HashMap<i64, TransferSignals>,
    paused_global: bool,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        db: Database,
        bucket: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            shared: Arc::new(EngineShared {
                store,
                db,
                bucket: bucket.into(),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                events_tx,
                state: Mutex::new(EngineState::default()),
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Number of transfers currently dispatched (running or waiting on a
    /// pool slot).
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().unwrap().active.len()
    }

    /// Dispatches a transfer to the worker pool. No-ops with a warning if
    /// the record doesn't exist.
    pub async fn enqueue(&self, transfer_id: i64) {
        EngineShared::enqueue(&self.shared, transfer_id).await;
    }

    /// Asks a running transfer to pause at its next safe point.
    pub async fn pause(&self, transfer_id: i64) {
        let signalled = {
            let state = self.shared.state.lock().unwrap();
            match state.signals.get(&transfer_id) {
                Some(signals) => {
                    signals.pause.cancel();
                    true
                }
                None => false,
            }
        };
        if signalled {
            self.shared
                .emit_status(transfer_id, TransferStatus::Paused)
                .await;
        }
    }

    /// Asks a running transfer to cancel at its next safe point.
    pub async fn cancel(&self, transfer_id: i64) {
        {
            let state = self.shared.state.lock().unwrap();
            if let Some(signals) = state.signals.get(&transfer_id) {
                signals.cancel.cancel();
            }
        }
        self.shared
            .emit_status(transfer_id, TransferStatus::Cancelled)
            .await;
    }

    /// Resumes a paused transfer by re-enqueuing it with fresh signals.
    /// Durable state (multipart parts, temp files) is picked back up by the
    /// new worker; nothing else survives from the previous run.
    pub async fn resume(&self, transfer_id: i64) {
        if let Err(err) = self
            .shared
            .db
            .set_status(transfer_id, TransferStatus::Queued)
            .await
        {
            warn!(transfer = transfer_id, error = %err, "failed to requeue for resume");
            return;
        }
        EngineShared::enqueue(&self.shared, transfer_id).await;
    }

    /// Retries a failed transfer from scratch: retry counter and error
    /// message cleared, then re-enqueued.
    pub async fn retry(&self, transfer_id: i64) {
        if let Err(err) = self.shared.db.reset_for_retry(transfer_id).await {
            warn!(transfer = transfer_id, error = %err, "failed to reset for retry");
            return;
        }
        EngineShared::enqueue(&self.shared, transfer_id).await;
    }

    /// Pauses every active transfer and stops admitting queued ones.
    pub async fn pause_all(&self) {
        let active: Vec<i64> = {
            let mut state = self.shared.state.lock().unwrap();
            state.paused_global = true;
            state.active.iter().copied().collect()
        };
        info!(count = active.len(), "pausing all transfers");
        for id in active {
            self.pause(id).await;
        }
    }

    /// Clears the global pause and re-enqueues every transfer persisted as
    /// paused for this bucket.
    pub async fn resume_all(&self) {
        self.shared.state.lock().unwrap().paused_global = false;
        let paused = match self.shared.db.paused_transfers(&self.shared.bucket).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failed to list paused transfers");
                return;
            }
        };
        info!(count = paused.len(), "resuming all transfers");
        for id in paused {
            self.resume(id).await;
        }
    }

    /// Crash recovery, called once at startup: requeues interrupted
    /// transfers and permanently fails those whose local precondition is
    /// gone.
    pub async fn restore_pending(&self) {
        let records = match self.shared.db.restorable_transfers().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to list restorable transfers");
                return;
            }
        };

        for record in records {
            let local = Path::new(&record.local_path);

            if record.direction == Direction::Upload && !local.exists() {
                // The source is gone; there is nothing to retry.
                if let Err(err) = self
                    .shared
                    .db
                    .mark_failed(record.id, "Source file no longer exists.")
                    .await
                {
                    warn!(transfer = record.id, error = %err, "failed to mark restore failure");
                }
                warn!(
                    transfer = record.id,
                    path = %record.local_path,
                    "restore: source file missing"
                );
                continue;
            }

            if record.direction == Direction::Download {
                let dir_missing = local
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .is_some_and(|p| !p.exists());
                if dir_missing {
                    if let Err(err) = self
                        .shared
                        .db
                        .mark_failed(record.id, "Destination directory no longer exists.")
                        .await
                    {
                        warn!(transfer = record.id, error = %err, "failed to mark restore failure");
                    }
                    warn!(
                        transfer = record.id,
                        path = %record.local_path,
                        "restore: destination directory missing"
                    );
                    continue;
                }
            }

            if record.status == TransferStatus::InProgress {
                // A prior run's in-flight state is not trustworthy; durable
                // multipart parts are rediscovered via list_parts on resume.
                if let Err(err) = self
                    .shared
                    .db
                    .set_status(record.id, TransferStatus::Queued)
                    .await
                {
                    warn!(transfer = record.id, error = %err, "failed to requeue on restore");
                    continue;
                }
            }

            EngineShared::enqueue(&self.shared, record.id).await;
            info!(transfer = record.id, "restored transfer");
        }
    }

    /// Aborts multipart uploads on the backend that no local record owns
    /// and that were initiated more than the grace window ago. Younger
    /// unknowns may belong to another tool and are left alone. Returns the
    /// number aborted; a listing failure logs and returns 0.
    pub async fn cleanup_orphaned_uploads(&self) -> usize {
        let uploads = match self.shared.store.list_multipart_uploads().await {
            Ok(uploads) => uploads,
            Err(err) => {
                warn!(error = %err, "failed to list multipart uploads for orphan cleanup");
                return 0;
            }
        };
        let known: HashSet<String> = match self.shared.db.known_upload_ids().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                warn!(error = %err, "failed to read known upload ids");
                return 0;
            }
        };

        let cutoff = Utc::now() - chrono::Duration::hours(ORPHAN_UPLOAD_GRACE_HOURS);
        let mut aborted = 0;

        for upload in uploads {
            if known.contains(&upload.upload_id) {
                continue;
            }
            if upload.initiated < cutoff {
                match self
                    .shared
                    .store
                    .abort_multipart_upload(&upload.key, &upload.upload_id)
                    .await
                {
                    Ok(()) => {
                        aborted += 1;
                        info!(
                            key = %upload.key,
                            upload_id = %upload.upload_id,
                            "aborted orphaned multipart upload"
                        );
                    }
                    Err(err) => warn!(
                        key = %upload.key,
                        upload_id = %upload.upload_id,
                        error = %err,
                        "failed to abort orphaned upload"
                    ),
                }
            } else {
                debug!(
                    key = %upload.key,
                    upload_id = %upload.upload_id,
                    "skipping recent orphaned upload"
                );
            }
        }

        if aborted > 0 {
            info!(aborted, "orphan cleanup finished");
        }
        aborted
    }
}

impl EngineShared {
    /// Runs after a worker returns, on every exit path: frees the registry
    /// entry, then admits the next queued transfer.
    async fn finish_transfer(this: &Arc<Self>, transfer_id: i64) {
        {
            let mut state = this.state.lock().unwrap();
            state.active.remove(&transfer_id);
            state.signals.remove(&transfer_id);
        }
        EngineShared::pick_next(this).await;
    }

    // `enqueue` and `pick_next` are mutually recursive async fns whose futures
    // must be `Send` (they are awaited inside `tokio::spawn`). Returning an
    // explicit boxed `Send` future instead of an `async fn` opaque type breaks
    // the auto-trait inference cycle rustc cannot resolve on its own.
    fn enqueue(
        this: &Arc<Self>,
        transfer_id: i64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let record = match this.db.get_transfer(transfer_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(transfer = transfer_id, "cannot enqueue: record not found");
                    return;
                }
                Err(err) => {
                    warn!(transfer = transfer_id, error = %err, "cannot enqueue: store read failed");
                    return;
                }
            };

            let signals = TransferSignals::new();
            {
                let mut state = this.state.lock().unwrap();
                state.active.insert(transfer_id);
                state.signals.insert(transfer_id, signals.clone());
            }

            let shared = Arc::clone(this);
            let direction = record.direction;
            tokio::spawn(async move {
                let Ok(_permit) = shared.permits.clone().acquire_owned().await else {
                    return;
                };
                match direction {
                    Direction::Upload => {
                        UploadWorker::new(
                            transfer_id,
                            Arc::clone(&shared.store),
                            shared.db.clone(),
                            signals,
                            shared.events_tx.clone(),
                        )
                        .run()
                        .await;
                    }
                    Direction::Download => {
                        DownloadWorker::new(
                            transfer_id,
                            Arc::clone(&shared.store),
                            shared.db.clone(),
                            signals,
                            shared.events_tx.clone(),
                        )
                        .run()
                        .await;
                    }
                }
                EngineShared::finish_transfer(&shared, transfer_id).await;
            });

            this.emit_status(transfer_id, TransferStatus::InProgress)
                .await;
            info!(
                transfer = transfer_id,
                direction = ?direction,
                "enqueued transfer"
            );
        })
    }

    fn pick_next(this: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if this.state.lock().unwrap().paused_global {
                return;
            }
            let queued = match this.db.next_queued(&this.bucket).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(error = %err, "failed to read transfer queue");
                    return;
                }
            };
            let next = {
                let state = this.state.lock().unwrap();
                queued.into_iter().find(|id| !state.active.contains(id))
            };
            if let Some(id) = next {
                EngineShared::enqueue(this, id).await;
            }
        })
    }

    async fn emit_status(&self, transfer_id: i64, status: TransferStatus) {
        let _ = self
            .events_tx
            .send(TransferEvent::StatusChanged {
                id: transfer_id,
                status,
            })
            .await;
    }
}
