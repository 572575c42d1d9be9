use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{BatchId, CommandId};
use crate::priority::CommandPriority;
use crate::status::CommandStatus;

/// The ten lifecycle/queue/batch/cancellation event kinds of spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CommandQueued,
    CommandStarted,
    CommandProgress,
    CommandCompleted,
    CommandFailed,
    CommandCancelled,
    CommandRetrying,
    QueueStatus,
    BatchEvent,
    CancellationEvent,
}

/// Payload emitted to the event sink boundary. Every variant carries
/// timestamp, subject id, status/state, priority and type per spec §6;
/// `extra` holds event-specific detail (progress fraction, batch counters,
/// retry delay, ...) rather than growing this struct per event kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub command_id: Option<CommandId>,
    pub batch_id: Option<BatchId>,
    pub status: Option<CommandStatus>,
    pub priority: Option<CommandPriority>,
    pub type_name: Option<String>,
    pub extra: HashMap<String, Value>,
}

impl CommandEvent {
    pub fn for_command(event_type: EventType, command_id: CommandId, status: CommandStatus, priority: CommandPriority, type_name: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            command_id: Some(command_id),
            batch_id: None,
            status: Some(status),
            priority: Some(priority),
            type_name: Some(type_name.into()),
            extra: HashMap::new(),
        }
    }

    pub fn for_batch(event_type: EventType, batch_id: BatchId) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            command_id: None,
            batch_id: Some(batch_id),
            status: None,
            priority: None,
            type_name: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Security-relevant action recorded by the audit sink boundary (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditAction {
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub user_id: Option<String>,
    pub details: HashMap<String, Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditAction {
    pub fn new(action: impl Into<String>, resource: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            resource_id: resource_id.into(),
            user_id: None,
            details: HashMap::new(),
            ip_address: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }
}
