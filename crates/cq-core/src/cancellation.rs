use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cq_types::{
    AuditAction, CancellationError, CancellationRequest, CancellationState, Command, CommandEvent, CommandId,
    CommandPriority, CommandStatus, EventType,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::sink::{AuditSink, EventSink};

/// The core's view into live command state, satisfied by `cq-runtime`. Kept
/// as a trait rather than a direct dependency on the queue/processor so the
/// Cancellation Manager owns only its own table, per spec §9's
/// message-owned-state guidance.
#[async_trait]
pub trait CommandDirectory: Send + Sync {
    async fn snapshot(&self, id: CommandId) -> Option<Command>;
    /// Removes the command from the queue if it is Pending/Queued/Retrying.
    /// Returns false if the command was not in a cancellable queue state.
    async fn cancel_pending(&self, id: CommandId) -> bool;
}

#[async_trait]
pub trait CleanupHandler: Send + Sync {
    fn resource_type(&self) -> &str;
    fn priority(&self) -> i32;
    fn timeout(&self) -> Duration;
    fn critical(&self) -> bool;
    async fn cleanup(&self, command_id: CommandId) -> Result<(), String>;
}

#[async_trait]
pub trait CompensatingAction: Send + Sync {
    fn action_type(&self) -> &str;
    async fn validate(&self, _command: &Command) -> bool {
        true
    }
    /// Produces the inverse command, or `None` if this action does not
    /// apply to the given command.
    async fn execute(&self, command: &Command) -> Option<Command>;
}

#[derive(Clone, Debug)]
pub struct CancellationConfig {
    pub cancellation_timeout_seconds: u64,
    pub non_cancellable_types: HashSet<String>,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            cancellation_timeout_seconds: 30,
            non_cancellable_types: ["emergency_stop", "firmware_update", "reset"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancellationStatistics {
    pub requested: u64,
    pub completed: u64,
    pub rejected: u64,
    pub failed: u64,
}

struct Inner {
    active: HashMap<CommandId, CancellationRequest>,
    history: Vec<CancellationRequest>,
    stats: CancellationStatistics,
}

/// State-machine-driven safe cancellation with cleanup + compensation
/// (spec §4.6). This is the safety-critical component: validation order and
/// the cleanup/rollback escalation rule below follow spec.md exactly,
/// including its resolution of the source's ambiguous escalation rule —
/// rollback is always attempted after cleanup, never gated on full
/// cleanup success.
pub struct CancellationManager {
    config: CancellationConfig,
    directory: Arc<dyn CommandDirectory>,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn EventSink>,
    cleanup_handlers: Mutex<Vec<Arc<dyn CleanupHandler>>>,
    compensating_actions: Mutex<HashMap<String, Arc<dyn CompensatingAction>>>,
    inner: Mutex<Inner>,
    history_limit: usize,
}

const MAX_HISTORY: usize = 10_000;

impl CancellationManager {
    pub fn new(
        config: CancellationConfig,
        directory: Arc<dyn CommandDirectory>,
        audit: Arc<dyn AuditSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            directory,
            audit,
            events,
            cleanup_handlers: Mutex::new(Vec::new()),
            compensating_actions: Mutex::new(HashMap::new()),
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                history: Vec::new(),
                stats: CancellationStatistics::default(),
            }),
            history_limit: MAX_HISTORY,
        }
    }

    pub async fn register_cleanup_handler(&self, handler: Arc<dyn CleanupHandler>) {
        self.cleanup_handlers.lock().await.push(handler);
    }

    pub async fn register_compensating_action(&self, type_name: impl Into<String>, action: Arc<dyn CompensatingAction>) {
        self.compensating_actions.lock().await.insert(type_name.into(), action);
    }

    pub async fn get_active(&self) -> Vec<CancellationRequest> {
        self.inner.lock().await.active.values().cloned().collect()
    }

    pub async fn get_history(&self, command_id: Option<CommandId>, limit: usize) -> Vec<CancellationRequest> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .rev()
            .filter(|r| command_id.is_none_or(|id| r.command_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> CancellationStatistics {
        self.inner.lock().await.stats.clone()
    }

    pub async fn request_cancellation(&self, mut request: CancellationRequest) -> Result<CancellationRequest, CancellationError> {
        let command_id = request.command_id;
        {
            let mut inner = self.inner.lock().await;
            if inner.active.contains_key(&command_id) {
                return Err(CancellationError::AlreadyInProgress { command_id });
            }
            inner.stats.requested += 1;
            request.state = CancellationState::Validating;
            inner.active.insert(command_id, request.clone());
        }

        let timeout = Duration::from_secs(self.config.cancellation_timeout_seconds);
        let outcome = tokio::time::timeout(timeout, self.drive(request.clone())).await;

        let finished = match outcome {
            Ok(finished) => finished,
            Err(_) => {
                warn!(command_id = %command_id, "cancellation exceeded its overall timeout");
                request.state = CancellationState::Failed;
                request.completed_at = Some(Utc::now());
                request.validation_errors.push("cancellation timed out".into());
                request
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.active.remove(&command_id);
            match finished.state {
                CancellationState::Completed => inner.stats.completed += 1,
                CancellationState::Rejected => inner.stats.rejected += 1,
                _ => inner.stats.failed += 1,
            }
            inner.history.push(finished.clone());
            if inner.history.len() > self.history_limit {
                let overflow = inner.history.len() - self.history_limit;
                inner.history.drain(0..overflow);
            }
        }

        self.audit
            .log_action(audit_entry(&finished))
            .await;

        self.emit_cancellation_events(&finished).await;

        Ok(finished)
    }

    /// Emits the generic `cancellation_event` for every terminal outcome,
    /// plus `command_cancelled` when the command actually reached Cancelled,
    /// per spec §6's event sink list.
    async fn emit_cancellation_events(&self, request: &CancellationRequest) {
        let (priority, type_name) = match self.directory.snapshot(request.command_id).await {
            Some(command) => (command.priority, command.type_name),
            None => (CommandPriority::Normal, String::from("unknown")),
        };
        let status = match request.state {
            CancellationState::Completed => CommandStatus::Cancelled,
            CancellationState::Rejected => CommandStatus::Executing,
            _ => CommandStatus::Failed,
        };
        self.events
            .emit(
                CommandEvent::for_command(EventType::CancellationEvent, request.command_id, status, priority, type_name.clone())
                    .with_extra("state", serde_json::json!(format!("{:?}", request.state)))
                    .with_extra("validation_errors", serde_json::json!(request.validation_errors)),
            )
            .await;
        if request.state == CancellationState::Completed {
            self.events
                .emit(CommandEvent::for_command(
                    EventType::CommandCancelled,
                    request.command_id,
                    CommandStatus::Cancelled,
                    priority,
                    type_name,
                ))
                .await;
        }
    }

    async fn drive(&self, mut request: CancellationRequest) -> CancellationRequest {
        let command_id = request.command_id;
        let Some(command) = self.directory.snapshot(command_id).await else {
            return reject(request, "command not found");
        };

        if command.status.is_terminal() {
            return reject(request, "command already in a terminal state");
        }
        if self.config.non_cancellable_types.contains(&command.type_name) && !request.force {
            return reject(request, "non-cancellable type");
        }
        if command.metadata.is_safety_critical() && !request.force {
            return reject(request, "safety-critical command");
        }

        request.state = CancellationState::Cancelling;

        if matches!(command.status, CommandStatus::Pending | CommandStatus::Queued | CommandStatus::Retrying) {
            self.directory.cancel_pending(command_id).await;
            request.state = CancellationState::Completed;
            request.completed_at = Some(Utc::now());
            return request;
        }

        // Executing: run cleanup handlers in descending priority order.
        request.state = CancellationState::CleaningUp;
        let handlers = self.cleanup_handlers.lock().await.clone();
        let mut handlers = handlers;
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority()));
        let mut critical_failed = false;
        for handler in &handlers {
            request.cleanup_actions_attempted.push(handler.resource_type().to_string());
            let result = tokio::time::timeout(handler.timeout(), handler.cleanup(command_id)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    warn!(command_id = %command_id, resource = handler.resource_type(), %reason, "cleanup handler failed");
                    request.validation_errors.push(format!("cleanup {} failed: {reason}", handler.resource_type()));
                    if handler.critical() && !request.force {
                        critical_failed = true;
                    }
                }
                Err(_) => {
                    warn!(command_id = %command_id, resource = handler.resource_type(), "cleanup handler timed out");
                    request.validation_errors.push(format!("cleanup {} timed out", handler.resource_type()));
                    if handler.critical() && !request.force {
                        critical_failed = true;
                    }
                }
            }
        }

        if critical_failed {
            request.state = CancellationState::Failed;
            request.completed_at = Some(Utc::now());
            return request;
        }

        if request.rollback_requested {
            request.state = CancellationState::RollingBack;
            self.run_rollback(&command, &mut request).await;
        }

        request.state = CancellationState::Completed;
        request.completed_at = Some(Utc::now());
        request
    }

    /// Rollback is always attempted once reached, regardless of whether
    /// cleanup fully succeeded — the explicit resolution of the source's
    /// ambiguous escalation rule (spec §9). Action failures are logged but
    /// never fail the cancellation; rollback is best-effort.
    async fn run_rollback(&self, command: &Command, request: &mut CancellationRequest) {
        let actions = self.compensating_actions.lock().await;
        if let Some(action) = actions.get(&command.type_name) {
            if action.validate(command).await {
                match action.execute(command).await {
                    Some(_inverse) => {
                        request.rollback_actions_attempted.push(action.action_type().to_string());
                        info!(command_id = %command.id, action = action.action_type(), "rollback action executed");
                    }
                    None => {
                        request.validation_errors.push("rollback action produced no inverse command".into());
                    }
                }
            }
        } else {
            request.validation_errors.push("no compensating action registered for this command type".into());
        }
    }
}

fn reject(mut request: CancellationRequest, reason: &str) -> CancellationRequest {
    request.state = CancellationState::Rejected;
    request.validation_errors.push(reason.to_string());
    request.completed_at = Some(Utc::now());
    request
}

fn audit_entry(request: &CancellationRequest) -> AuditAction {
    let mut action = AuditAction::new("cancel_command", "command", request.command_id.to_string());
    action.user_id = Some(request.requester.clone());
    action.ip_address = request.requester_ip.clone();
    action.details.insert("state".into(), serde_json::json!(format!("{:?}", request.state)));
    action.details.insert("force".into(), serde_json::json!(request.force));
    action.details.insert("rollback_requested".into(), serde_json::json!(request.rollback_requested));
    action.details.insert("validation_errors".into(), serde_json::json!(request.validation_errors));
    action.details.insert("cleanup_actions".into(), serde_json::json!(request.cleanup_actions_attempted));
    action.details.insert("rollback_actions".into(), serde_json::json!(request.rollback_actions_attempted));
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_types::{CommandCategory, CommandMetadata, CommandPriority};
    use std::sync::Mutex as StdMutex;

    struct FakeDirectory {
        commands: StdMutex<HashMap<CommandId, Command>>,
    }

    #[async_trait]
    impl CommandDirectory for FakeDirectory {
        async fn snapshot(&self, id: CommandId) -> Option<Command> {
            self.commands.lock().unwrap().get(&id).cloned()
        }

        async fn cancel_pending(&self, id: CommandId) -> bool {
            let mut commands = self.commands.lock().unwrap();
            if let Some(c) = commands.get_mut(&id) {
                c.status = CommandStatus::Cancelled;
                true
            } else {
                false
            }
        }
    }

    fn directory_with(command: Command) -> Arc<FakeDirectory> {
        let mut map = HashMap::new();
        map.insert(command.id, command);
        Arc::new(FakeDirectory { commands: StdMutex::new(map) })
    }

    #[tokio::test]
    async fn cancelling_a_queued_command_completes_synchronously() {
        let mut command = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
        command.status = CommandStatus::Queued;
        let command_id = command.id;
        let directory = directory_with(command);
        let manager = CancellationManager::new(CancellationConfig::default(), directory, Arc::new(crate::sink::NullAuditSink), Arc::new(crate::sink::NullEventSink));

        let request = CancellationRequest::new(command_id, "operator", cq_types::CancellationReason::UserRequested);
        let result = manager.request_cancellation(request).await.unwrap();
        assert_eq!(result.state, CancellationState::Completed);
    }

    #[tokio::test]
    async fn non_cancellable_type_without_force_is_rejected() {
        let mut command = Command::new("emergency_stop", CommandCategory::System, CommandPriority::Emergency);
        command.status = CommandStatus::Executing;
        let command_id = command.id;
        let directory = directory_with(command);
        let manager = CancellationManager::new(CancellationConfig::default(), directory, Arc::new(crate::sink::NullAuditSink), Arc::new(crate::sink::NullEventSink));

        let request = CancellationRequest::new(command_id, "operator", cq_types::CancellationReason::UserRequested);
        let result = manager.request_cancellation(request).await.unwrap();
        assert_eq!(result.state, CancellationState::Rejected);
        assert!(result.validation_errors.iter().any(|e| e.contains("non-cancellable")));
    }

    #[tokio::test]
    async fn safety_critical_flag_blocks_cancellation_without_force() {
        let mut command = Command::new("set_power", CommandCategory::System, CommandPriority::High);
        command.status = CommandStatus::Executing;
        command.metadata = CommandMetadata {
            custom_data: [("safety_critical".to_string(), serde_json::json!(true))].into(),
            ..Default::default()
        };
        let command_id = command.id;
        let directory = directory_with(command);
        let manager = CancellationManager::new(CancellationConfig::default(), directory, Arc::new(crate::sink::NullAuditSink), Arc::new(crate::sink::NullEventSink));

        let request = CancellationRequest::new(command_id, "operator", cq_types::CancellationReason::UserRequested);
        let result = manager.request_cancellation(request).await.unwrap();
        assert_eq!(result.state, CancellationState::Rejected);
    }

    #[tokio::test]
    async fn concurrent_cancellation_of_same_command_is_rejected_as_already_in_progress() {
        let mut command = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
        command.status = CommandStatus::Executing;
        let command_id = command.id;
        let directory = directory_with(command);
        let manager = Arc::new(CancellationManager::new(CancellationConfig::default(), directory, Arc::new(crate::sink::NullAuditSink), Arc::new(crate::sink::NullEventSink)));

        // Manually mark active to simulate a request already in flight.
        {
            let mut inner = manager.inner.lock().await;
            inner.active.insert(
                command_id,
                CancellationRequest::new(command_id, "first", cq_types::CancellationReason::UserRequested),
            );
        }

        let second = CancellationRequest::new(command_id, "second", cq_types::CancellationReason::UserRequested);
        let err = manager.request_cancellation(second).await.unwrap_err();
        assert_eq!(err, CancellationError::AlreadyInProgress { command_id });
    }
}
