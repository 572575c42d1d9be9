use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::ids::{BatchId, CommandId};
use crate::priority::CommandPriority;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchExecutionMode {
    Sequential,
    Parallel,
    Mixed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchTransactionMode {
    AllOrNothing,
    BestEffort,
    StopOnError,
    Isolated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Validating,
    Queued,
    Executing,
    PartiallyCompleted,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Cancelled
                | BatchStatus::RolledBack
        )
    }
}

/// A directed dependency edge between two members of the same batch,
/// interpreted by the Mixed execution mode's topological layering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDependency {
    pub from_command_id: CommandId,
    pub to_command_id: CommandId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub description: Option<String>,
    pub commands: Vec<Command>,
    pub dependencies: Vec<BatchDependency>,
    pub execution_mode: BatchExecutionMode,
    pub transaction_mode: BatchTransactionMode,
    pub priority: CommandPriority,
    pub metadata: HashMap<String, Value>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_commands: usize,
    pub completed_commands: usize,
    pub failed_commands: usize,
    pub command_results: HashMap<CommandId, CommandResult>,
    pub error_summary: Vec<String>,
    /// Compensating commands, generated eagerly pre-execution, to be
    /// replayed in reverse completion order on rollback.
    pub rollback_plan: Option<Vec<Command>>,
    pub rollback_status: Option<String>,
}

impl Batch {
    pub fn new(
        name: impl Into<String>,
        commands: Vec<Command>,
        execution_mode: BatchExecutionMode,
        transaction_mode: BatchTransactionMode,
        priority: CommandPriority,
    ) -> Self {
        let total_commands = commands.len();
        Self {
            id: BatchId::new(),
            name: name.into(),
            description: None,
            commands,
            dependencies: Vec::new(),
            execution_mode,
            transaction_mode,
            priority,
            metadata: HashMap::new(),
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_commands,
            completed_commands: 0,
            failed_commands: 0,
            command_results: HashMap::new(),
            error_summary: Vec::new(),
            rollback_plan: None,
            rollback_status: None,
        }
    }
}
