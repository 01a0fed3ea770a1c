//! Shared worker plumbing: control signals, retry backoff, part sizing.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{DEFAULT_PART_SIZE, HUGE_PART_SIZE, LARGE_PART_SIZE};

/// Pause/cancel signal pair for one in-flight transfer.
///
/// Workers poll these at part/chunk boundaries only; a signal raised while
/// a request is in flight takes effect when that request returns. A fresh
/// pair is created on every enqueue, so a resumed transfer starts
/// unsignalled.
#[derive(Clone, Default)]
pub struct TransferSignals {
    pub pause: CancellationToken,
    pub cancel: CancellationToken,
}

impl TransferSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A worker failure carrying a user-facing message plus the raw diagnostic.
#[derive(Debug)]
pub(crate) struct WorkerFailure {
    pub message: String,
    pub detail: String,
}

impl WorkerFailure {
    pub fn new(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: detail.into(),
        }
    }
}

impl From<bucketeer_client::ClientError> for WorkerFailure {
    fn from(err: bucketeer_client::ClientError) -> Self {
        Self {
            message: err.user_message,
            detail: err.detail,
        }
    }
}

impl From<bucketeer_db::DbError> for WorkerFailure {
    fn from(err: bucketeer_db::DbError) -> Self {
        Self {
            message: "A local database error occurred.".to_string(),
            detail: err.to_string(),
        }
    }
}

impl From<std::io::Error> for WorkerFailure {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: "A local file error occurred.".to_string(),
            detail: err.to_string(),
        }
    }
}

/// Chooses a multipart part size by file size, keeping the part count under
/// the backend's 10,000-part ceiling.
pub fn select_part_size(file_size: i64) -> i64 {
    const GIB: i64 = 1024 * 1024 * 1024;
    if file_size <= 50 * GIB {
        DEFAULT_PART_SIZE
    } else if file_size <= 500 * GIB {
        LARGE_PART_SIZE
    } else {
        HUGE_PART_SIZE
    }
}

/// Delay before retrying attempt `attempt` (0-indexed): nothing before the
/// first retry, then exponential base-4 with up to 50% jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let base = 4u64.pow(attempt - 1) as f64;
    let jitter = rand::thread_rng().gen_range(0.0..=base * 0.5);
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1024 * 1024 * 1024;

    #[test]
    fn backoff_first_retry_is_immediate() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_with_jitter_bounds() {
        for _ in 0..100 {
            let second = backoff_delay(1).as_secs_f64();
            assert!((1.0..=1.5).contains(&second), "got {second}");

            let third = backoff_delay(2).as_secs_f64();
            assert!((4.0..=6.0).contains(&third), "got {third}");
        }
    }

    #[test]
    fn part_size_tiers() {
        assert_eq!(select_part_size(0), DEFAULT_PART_SIZE);
        assert_eq!(select_part_size(9 * 1024 * 1024), DEFAULT_PART_SIZE);
        assert_eq!(select_part_size(50 * GIB), DEFAULT_PART_SIZE);
        assert_eq!(select_part_size(50 * GIB + 1), LARGE_PART_SIZE);
        assert_eq!(select_part_size(500 * GIB), LARGE_PART_SIZE);
        assert_eq!(select_part_size(500 * GIB + 1), HUGE_PART_SIZE);
    }

    #[test]
    fn fresh_signals_are_unset() {
        let signals = TransferSignals::new();
        assert!(!signals.pause.is_cancelled());
        assert!(!signals.cancel.is_cancelled());

        signals.pause.cancel();
        assert!(signals.pause.is_cancelled());
        assert!(!signals.cancel.is_cancelled());
    }
}
