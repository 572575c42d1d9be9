use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::CommandResult;
use crate::ids::{CommandId, TrackingId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    Pending,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Retrying,
}

impl AckStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AckStatus::Completed | AckStatus::Failed | AckStatus::Timeout)
    }
}

/// 1:1 in-flight tracking record for a [`Command`](crate::command::Command),
/// distinct from the command's own status (spec §3 / glossary).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub tracking_id: TrackingId,
    pub command_id: CommandId,
    pub status: AckStatus,
    pub progress: f64,
    pub progress_message: Option<String>,
    pub ack_retry_count: u32,
    pub result: Option<CommandResult>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Acknowledgment {
    pub fn new(command_id: CommandId) -> Self {
        Self {
            tracking_id: TrackingId::new(),
            command_id,
            status: AckStatus::Pending,
            progress: 0.0,
            progress_message: None,
            ack_retry_count: 0,
            result: None,
            created_at: Utc::now(),
            acknowledged_at: None,
            completed_at: None,
        }
    }
}
