//! Events emitted by the engine and its workers.

use bucketeer_db::TransferStatus;
use serde::Serialize;

/// Event stream consumed by the transfer panel.
///
/// Progress is emitted on every chunk/part, speed at most twice a second,
/// and exactly one terminal event (`Finished` or `Failed`) per worker run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress {
        id: i64,
        bytes_done: i64,
        total: i64,
    },
    Speed {
        id: i64,
        bytes_per_sec: f64,
    },
    StatusChanged {
        id: i64,
        status: TransferStatus,
    },
    Failed {
        id: i64,
        /// Short message suitable for direct display.
        message: String,
        /// Raw diagnostic for a "show details" expander.
        detail: String,
    },
    Finished {
        id: i64,
    },
}

impl TransferEvent {
    /// The transfer this event belongs to.
    pub fn transfer_id(&self) -> i64 {
        match self {
            Self::Progress { id, .. }
            | Self::Speed { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::Failed { id, .. }
            | Self::Finished { id } => *id,
        }
    }

    /// True for `Finished` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_tag() {
        let event = TransferEvent::Progress {
            id: 7,
            bytes_done: 512,
            total: 1024,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["id"], 7);
        assert_eq!(json["bytes_done"], 512);

        let event = TransferEvent::StatusChanged {
            id: 7,
            status: TransferStatus::InProgress,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["status"], "in_progress");
    }

    #[test]
    fn terminal_classification() {
        assert!(TransferEvent::Finished { id: 1 }.is_terminal());
        assert!(
            TransferEvent::Failed {
                id: 1,
                message: String::new(),
                detail: String::new(),
            }
            .is_terminal()
        );
        assert!(
            !TransferEvent::Progress {
                id: 1,
                bytes_done: 0,
                total: 0,
            }
            .is_terminal()
        );
        assert_eq!(TransferEvent::Finished { id: 9 }.transfer_id(), 9);
    }
}
