use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CommandId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancellationState {
    Requested,
    Validating,
    Cancelling,
    CleaningUp,
    RollingBack,
    Completed,
    Failed,
    Rejected,
}

impl CancellationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CancellationState::Completed | CancellationState::Failed | CancellationState::Rejected
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancellationReason {
    UserRequested,
    SafetyStop,
    SupersededByHigherPriority,
    SystemShutdown,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub command_id: CommandId,
    pub requester: String,
    pub requester_ip: Option<String>,
    pub reason: CancellationReason,
    pub force: bool,
    pub rollback_requested: bool,
    pub notes: Option<String>,
    pub state: CancellationState,
    pub validation_errors: Vec<String>,
    pub cleanup_actions_attempted: Vec<String>,
    pub rollback_actions_attempted: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CancellationRequest {
    pub fn new(command_id: CommandId, requester: impl Into<String>, reason: CancellationReason) -> Self {
        Self {
            command_id,
            requester: requester.into(),
            requester_ip: None,
            reason,
            force: false,
            rollback_requested: false,
            notes: None,
            state: CancellationState::Requested,
            validation_errors: Vec::new(),
            cleanup_actions_attempted: Vec::new(),
            rollback_actions_attempted: Vec::new(),
            requested_at: Utc::now(),
            completed_at: None,
        }
    }
}
