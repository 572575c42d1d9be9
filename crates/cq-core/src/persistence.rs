use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cq_types::{Command, CommandId, CommandPriority, CommandResult, CommandStatus, PersistenceError};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub retention_days: i64,
    pub checkpoint_interval: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            checkpoint_interval: 1000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub command_id: CommandId,
    pub status: CommandStatus,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MetricEntry {
    pub metric_type: String,
    pub value: f64,
    pub command_type: Option<String>,
    pub priority: Option<CommandPriority>,
    pub timestamp: DateTime<Utc>,
}

/// Durable mirror of the queue and acknowledgment state; replayed on
/// restart (spec §4.2). Implementations may be swapped freely — the
/// workspace ships only [`InMemoryPersistence`], since the teacher's
/// dependency stack carries no embedded-database crate.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn save(&self, command: &Command) -> Result<(), PersistenceError>;
    async fn save_batch(&self, commands: &[Command]) -> Result<usize, PersistenceError>;
    async fn update_status(&self, id: CommandId, status: CommandStatus, result: Option<CommandResult>) -> Result<(), PersistenceError>;
    async fn load_pending(&self) -> Result<Vec<Command>, PersistenceError>;
    async fn get(&self, id: CommandId) -> Result<Option<Command>, PersistenceError>;
    async fn save_metric(&self, metric_type: &str, value: f64, command_type: Option<String>, priority: Option<CommandPriority>) -> Result<(), PersistenceError>;
    async fn get_metrics(&self, metric_type: &str, since: DateTime<Utc>) -> Result<Vec<MetricEntry>, PersistenceError>;
    async fn cleanup_older_than(&self, days: i64) -> Result<usize, PersistenceError>;
}

struct Inner {
    commands: HashMap<CommandId, Command>,
    history: Vec<HistoryEntry>,
    metrics: Vec<MetricEntry>,
    writes_since_checkpoint: u64,
}

/// Single-writer, in-memory reference implementation of [`PersistencePort`].
/// A single `tokio::sync::Mutex` serializes mutations (the "single writer
/// lock" of spec §4.2); reads take an immutable clone of the relevant
/// record so they never block behind a concurrent writer for longer than
/// the clone itself, approximating the "readers do not block writers"
/// guarantee without an embedded database dependency.
pub struct InMemoryPersistence {
    config: PersistenceConfig,
    inner: Mutex<Inner>,
}

impl InMemoryPersistence {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                commands: HashMap::new(),
                history: Vec::new(),
                metrics: Vec::new(),
                writes_since_checkpoint: 0,
            }),
        }
    }

    /// Periodic compaction, generalized from the source's SQLite WAL
    /// checkpoint: bounds the append-only history vector once
    /// `checkpoint_interval` writes have accumulated.
    fn maybe_checkpoint(&self, inner: &mut Inner) {
        inner.writes_since_checkpoint += 1;
        if inner.writes_since_checkpoint >= self.config.checkpoint_interval {
            let cutoff = inner.history.len().saturating_sub(self.config.checkpoint_interval as usize * 10);
            inner.history.drain(0..cutoff);
            inner.writes_since_checkpoint = 0;
            debug!("persistence checkpoint compacted history");
        }
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn save(&self, command: &Command) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        inner.commands.insert(command.id, command.clone());
        inner.history.push(HistoryEntry {
            command_id: command.id,
            status: command.status,
            timestamp: Utc::now(),
            detail: None,
        });
        self.maybe_checkpoint(&mut inner);
        Ok(())
    }

    async fn save_batch(&self, commands: &[Command]) -> Result<usize, PersistenceError> {
        let mut inner = self.inner.lock().await;
        for command in commands {
            inner.commands.insert(command.id, command.clone());
            inner.history.push(HistoryEntry {
                command_id: command.id,
                status: command.status,
                timestamp: Utc::now(),
                detail: None,
            });
        }
        self.maybe_checkpoint(&mut inner);
        Ok(commands.len())
    }

    async fn update_status(&self, id: CommandId, status: CommandStatus, result: Option<CommandResult>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        let command = inner.commands.get_mut(&id).ok_or(PersistenceError::NotFound { command_id: id })?;
        command.status = status;
        let now = Utc::now();
        match status {
            CommandStatus::Queued => command.queued_at = Some(now),
            CommandStatus::Executing => command.started_at = Some(now),
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled | CommandStatus::Timeout => {
                command.completed_at = Some(now);
                command.result = result;
            }
            _ => {}
        }
        inner.history.push(HistoryEntry {
            command_id: id,
            status,
            timestamp: now,
            detail: None,
        });
        self.maybe_checkpoint(&mut inner);
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Command>, PersistenceError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Command> = inner
            .commands
            .values()
            .filter(|c| matches!(c.status, CommandStatus::Pending | CommandStatus::Queued | CommandStatus::Retrying))
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(pending)
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>, PersistenceError> {
        let inner = self.inner.lock().await;
        Ok(inner.commands.get(&id).cloned())
    }

    async fn save_metric(&self, metric_type: &str, value: f64, command_type: Option<String>, priority: Option<CommandPriority>) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        inner.metrics.push(MetricEntry {
            metric_type: metric_type.to_string(),
            value,
            command_type,
            priority,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn get_metrics(&self, metric_type: &str, since: DateTime<Utc>) -> Result<Vec<MetricEntry>, PersistenceError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .metrics
            .iter()
            .filter(|m| m.metric_type == metric_type && m.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn cleanup_older_than(&self, days: i64) -> Result<usize, PersistenceError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut inner = self.inner.lock().await;
        let before = inner.commands.len();
        inner.commands.retain(|_, c| {
            !(c.status.is_terminal() && c.completed_at.is_some_and(|t| t < cutoff))
        });
        let deleted = before - inner.commands.len();
        inner.history.retain(|h| h.timestamp >= cutoff);
        inner.metrics.retain(|m| m.timestamp >= cutoff);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_types::CommandCategory;

    fn cmd() -> Command {
        Command::new("ping", CommandCategory::System, CommandPriority::Normal)
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = InMemoryPersistence::new(PersistenceConfig::default());
        let command = cmd();
        let id = command.id;
        store.save(&command).await.unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
    }

    #[tokio::test]
    async fn update_status_on_unknown_command_errors() {
        let store = InMemoryPersistence::new(PersistenceConfig::default());
        let err = store.update_status(CommandId::new(), CommandStatus::Completed, None).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn load_pending_sorts_priority_major_creation_minor() {
        let store = InMemoryPersistence::new(PersistenceConfig::default());
        let mut low = Command::new("ping", CommandCategory::System, CommandPriority::Low);
        low.status = CommandStatus::Queued;
        let mut high = Command::new("ping", CommandCategory::System, CommandPriority::High);
        high.status = CommandStatus::Queued;
        store.save(&low).await.unwrap();
        store.save(&high).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending[0].priority, CommandPriority::High);
    }

    #[tokio::test]
    async fn cleanup_older_than_removes_only_stale_terminal_commands() {
        let store = InMemoryPersistence::new(PersistenceConfig::default());
        let mut done = cmd();
        done.status = CommandStatus::Completed;
        done.completed_at = Some(Utc::now() - ChronoDuration::days(30));
        store.save(&done).await.unwrap();
        let fresh = cmd();
        store.save(&fresh).await.unwrap();

        let deleted = store.cleanup_older_than(7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }
}
