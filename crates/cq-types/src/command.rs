use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::category::CommandCategory;
use crate::ids::CommandId;
use crate::priority::CommandPriority;
use crate::status::CommandStatus;

/// Submitter identity, correlation tags, and caller-defined labels carried
/// alongside a command for its whole lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub source: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Carries boundary-enforced flags such as `safety_critical`, and
    /// batch-wiring keys (`batch_id`, `batch_name`, `rollback_for`) set by
    /// the Batch Executor when a command runs as a batch member.
    #[serde(default)]
    pub custom_data: HashMap<String, Value>,
}

impl CommandMetadata {
    pub fn is_safety_critical(&self) -> bool {
        self.custom_data
            .get("safety_critical")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Canonical error kind for a terminal Failed command, distinct from the
/// queue/batch/cancellation error taxonomies since a handler failure is
/// recorded on the command itself, not returned synchronously to a caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultErrorKind {
    Deadline,
    Precondition,
    Exception,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub success: bool,
    pub status: CommandStatus,
    pub result_data: Option<Value>,
    pub error_kind: Option<ResultErrorKind>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn success(command_id: CommandId, status: CommandStatus, result_data: Option<Value>, execution_time_ms: u64) -> Self {
        Self {
            command_id,
            success: true,
            status,
            result_data,
            error_kind: None,
            error_message: None,
            error_detail: None,
            execution_time_ms: Some(execution_time_ms),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        command_id: CommandId,
        status: CommandStatus,
        kind: ResultErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            success: false,
            status,
            result_data: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            error_detail: None,
            execution_time_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }
}

/// The unit of work. `type_name` is the caller-chosen fine-grained label
/// (e.g. "move_forward", "emergency_stop"); `category` is the coarse,
/// closed dispatch grouping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub type_name: String,
    pub category: CommandCategory,
    pub priority: CommandPriority,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub metadata: CommandMetadata,
    pub timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<CommandResult>,
}

impl Command {
    pub fn new(type_name: impl Into<String>, category: CommandCategory, priority: CommandPriority) -> Self {
        Self {
            id: CommandId::new(),
            type_name: type_name.into(),
            category,
            priority,
            parameters: HashMap::new(),
            metadata: CommandMetadata::default(),
            timeout_ms: 30_000,
            queue_timeout_ms: 60_000,
            max_retries: 3,
            retry_count: 0,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Applies a status transition, rejecting anything outside the graph
    /// in spec §4.5. Callers must check the return value; this never
    /// panics on an illegal transition.
    pub fn transition_to(&mut self, next: CommandStatus) -> Result<(), CommandStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_critical_defaults_to_false() {
        let meta = CommandMetadata::default();
        assert!(!meta.is_safety_critical());
    }

    #[test]
    fn safety_critical_reads_custom_data_flag() {
        let mut meta = CommandMetadata::default();
        meta.custom_data.insert("safety_critical".into(), Value::Bool(true));
        assert!(meta.is_safety_critical());
    }

    #[test]
    fn illegal_transition_leaves_status_untouched() {
        let mut cmd = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
        let err = cmd.transition_to(CommandStatus::Executing).unwrap_err();
        assert_eq!(err, CommandStatus::Pending);
        assert_eq!(cmd.status, CommandStatus::Pending);
    }

    #[test]
    fn legal_transition_chain_succeeds() {
        let mut cmd = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
        cmd.transition_to(CommandStatus::Queued).unwrap();
        cmd.transition_to(CommandStatus::Executing).unwrap();
        cmd.transition_to(CommandStatus::Completed).unwrap();
        assert!(cmd.status.is_terminal());
    }
}
