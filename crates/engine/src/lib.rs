//! Transfer engine for Bucketeer.
//!
//! Moves objects between local disk and the remote bucket: a bounded worker
//! pool, single-shot and resumable multipart/ranged transfers, cooperative
//! pause/cancel, per-chunk retry with backoff, crash recovery, and cleanup
//! of orphaned multipart uploads.

mod download;
mod engine;
mod events;
mod speed;
mod upload;
mod worker;

pub use download::DownloadWorker;
pub use engine::TransferEngine;
pub use events::TransferEvent;
pub use speed::{SPEED_EMIT_INTERVAL, SPEED_WINDOW, SpeedMeter};
pub use upload::UploadWorker;
pub use worker::{TransferSignals, select_part_size};

/// Uploads and downloads at or above this size take the multipart/ranged
/// path; below it, a single request.
pub const MULTIPART_THRESHOLD: i64 = 8 * 1024 * 1024;

/// Part size for files up to 50 GiB.
pub const DEFAULT_PART_SIZE: i64 = 8 * 1024 * 1024;

/// Part size for files up to 500 GiB.
pub const LARGE_PART_SIZE: i64 = 64 * 1024 * 1024;

/// Part size above 500 GiB, keeping the part count under the backend's
/// 10,000-part ceiling.
pub const HUGE_PART_SIZE: i64 = 512 * 1024 * 1024;

/// Chunk size for ranged downloads.
pub const DOWNLOAD_CHUNK_SIZE: i64 = DEFAULT_PART_SIZE;

/// Attempts per part/chunk before the whole transfer fails.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default bound on concurrently running transfers.
pub const MAX_CONCURRENT_TRANSFERS: usize = 4;

/// Multipart uploads unknown to the local store are aborted once older than
/// this many hours; younger ones may belong to another tool and are left
/// alone.
pub const ORPHAN_UPLOAD_GRACE_HOURS: i64 = 24;
