use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use cq_types::{AdmissionError, Command, CommandId, CommandPriority, CommandStatus};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Defaults mirror the source's `CommandQueueConfig` dataclass.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_commands_per_priority: usize,
    pub max_retries_global: u32,
    pub retry_window_seconds: u64,
    pub stale_command_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_commands_per_priority: 250,
            max_retries_global: 100,
            retry_window_seconds: 60,
            stale_command_timeout_seconds: 300,
            cleanup_interval_seconds: 30,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueueStatistics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_cancelled: u64,
    pub total_completed: u64,
    pub total_timed_out: u64,
    pub size_by_priority: HashMap<CommandPriority, usize>,
}

/// Result of one `dequeue` scan: at most one dispatched command, plus any
/// commands discarded as Timeout while scanning past them.
pub struct DequeueOutcome {
    pub dispatched: Option<Command>,
    pub timed_out: Vec<Command>,
}

struct Entry {
    command: Command,
    queued_since: Instant,
    /// Queue deadline derived from `queue_timeout_ms`, checked with a
    /// monotonic clock so system-clock adjustments cannot mask or
    /// fabricate a timeout.
    deadline: Instant,
}

/// Priority-ordered, per-priority-capped, FIFO-within-priority store of
/// ready work (spec §4.1). Arrival order is tracked by a monotone counter,
/// never wall-clock, per spec's explicit correction of the source's
/// clock-skew hazard.
pub struct PriorityQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    sequence: AtomicU64,
}

struct Inner {
    lanes: HashMap<CommandPriority, VecDeque<Entry>>,
    index: HashSet<CommandId>,
    shutdown: bool,
    retry_timestamps: VecDeque<Instant>,
    stats: QueueStatistics,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        let mut lanes = HashMap::new();
        for p in CommandPriority::ALL {
            lanes.insert(p, VecDeque::new());
        }
        Self {
            config,
            inner: Mutex::new(Inner {
                lanes,
                index: HashSet::new(),
                shutdown: false,
                retry_timestamps: VecDeque::new(),
                stats: QueueStatistics::default(),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutdown = true;
    }

    pub async fn enqueue(&self, mut command: Command) -> Result<(), AdmissionError> {
        let mut inner = self.inner.lock().await;
        if inner.shutdown {
            return Err(AdmissionError::Shutdown);
        }
        let total: usize = inner.lanes.values().map(VecDeque::len).sum();
        if total >= self.config.max_queue_size {
            return Err(AdmissionError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        let lane = inner.lanes.get(&command.priority).expect("all priorities initialized");
        if lane.len() >= self.config.max_commands_per_priority {
            return Err(AdmissionError::PerPriorityFull {
                capacity: self.config.max_commands_per_priority,
            });
        }

        let _sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        command.transition_to(CommandStatus::Queued).ok();
        command.queued_at = Some(Utc::now());
        let now = Instant::now();
        let deadline = now + std::time::Duration::from_millis(command.queue_timeout_ms);
        let id = command.id;

        inner.index.insert(id);
        inner.lanes.get_mut(&command.priority).unwrap().push_back(Entry {
            command,
            queued_since: now,
            deadline,
        });
        inner.stats.total_enqueued += 1;
        debug!(command_id = %id, "command enqueued");
        Ok(())
    }

    /// Returns the highest-priority, oldest-within-priority command whose
    /// priority is in `allowed`, transitioning it to Executing. Commands
    /// whose queue wait exceeded their queue-timeout are discarded as
    /// Timeout and scanning continues, per spec §4.1.
    pub async fn dequeue(&self, allowed: &[CommandPriority]) -> DequeueOutcome {
        let mut inner = self.inner.lock().await;
        let mut timed_out = Vec::new();
        for priority in CommandPriority::dispatch_order() {
            if !allowed.contains(&priority) {
                continue;
            }
            let Some(lane) = inner.lanes.get_mut(&priority) else { continue };
            loop {
                let Some(entry) = lane.front() else { break };
                if Instant::now() >= entry.deadline {
                    let mut entry = lane.pop_front().unwrap();
                    inner.index.remove(&entry.command.id);
                    entry.command.transition_to(CommandStatus::Timeout).ok();
                    inner.stats.total_timed_out += 1;
                    warn!(command_id = %entry.command.id, "command timed out waiting in queue");
                    timed_out.push(entry.command);
                    continue;
                }
                let mut entry = lane.pop_front().unwrap();
                inner.index.remove(&entry.command.id);
                entry.command.transition_to(CommandStatus::Executing).ok();
                entry.command.started_at = Some(Utc::now());
                inner.stats.total_dequeued += 1;
                return DequeueOutcome { dispatched: Some(entry.command), timed_out };
            }
        }
        DequeueOutcome { dispatched: None, timed_out }
    }

    pub async fn cancel(&self, id: CommandId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.index.contains(&id) {
            return false;
        }
        for lane in inner.lanes.values_mut() {
            if let Some(pos) = lane.iter().position(|e| e.command.id == id) {
                lane.remove(pos);
                inner.index.remove(&id);
                inner.stats.total_cancelled += 1;
                return true;
            }
        }
        false
    }

    /// Counts the retry exactly once against the global retry throttle,
    /// per spec's explicit resolution of the source's double-counting bug.
    pub async fn requeue(&self, mut command: Command, new_priority: Option<CommandPriority>) -> Result<(), AdmissionError> {
        {
            let mut inner = self.inner.lock().await;
            let window = std::time::Duration::from_secs(self.config.retry_window_seconds);
            let now = Instant::now();
            while inner.retry_timestamps.front().is_some_and(|t| now.duration_since(*t) > window) {
                inner.retry_timestamps.pop_front();
            }
            if inner.retry_timestamps.len() as u32 >= self.config.max_retries_global {
                return Err(AdmissionError::GlobalRetryLimitExceeded {
                    max_per_window: self.config.max_retries_global,
                    window_seconds: self.config.retry_window_seconds,
                });
            }
            inner.retry_timestamps.push_back(now);
        }
        command.retry_count += 1;
        if let Some(p) = new_priority {
            command.priority = p;
        }
        command.transition_to(CommandStatus::Retrying).ok();
        self.enqueue(command).await
    }

    pub async fn complete(&self, _id: CommandId) {
        let mut inner = self.inner.lock().await;
        inner.stats.total_completed += 1;
    }

    pub async fn size_by_priority(&self) -> HashMap<CommandPriority, usize> {
        let inner = self.inner.lock().await;
        inner.lanes.iter().map(|(p, l)| (*p, l.len())).collect()
    }

    pub async fn stats(&self) -> QueueStatistics {
        let inner = self.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.size_by_priority = inner.lanes.iter().map(|(p, l)| (*p, l.len())).collect();
        stats
    }

    /// Discards entries whose per-command `queue_timeout_ms` deadline has
    /// passed, regardless of whether their priority currently has free
    /// dispatch capacity. `dequeue` alone only notices an expired deadline
    /// while actively scanning a capacity-eligible lane, so a priority
    /// saturated at its concurrency cap would otherwise let a timed-out
    /// entry sit forever (spec §4.1's queue-timeout is a wait-time bound,
    /// not a dispatch-eligibility side effect).
    pub async fn sweep_timeouts(&self) -> Vec<Command> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let mut timed_out = Vec::new();
        for lane in inner.lanes.values_mut() {
            let mut i = 0;
            while i < lane.len() {
                if now >= lane[i].deadline {
                    let mut entry = lane.remove(i).unwrap();
                    entry.command.transition_to(CommandStatus::Timeout).ok();
                    timed_out.push(entry.command);
                } else {
                    i += 1;
                }
            }
        }
        for command in &timed_out {
            inner.index.remove(&command.id);
        }
        inner.stats.total_timed_out += timed_out.len() as u64;
        timed_out
    }

    /// Background sweep: commands stuck Queued past
    /// `stale_command_timeout_seconds` are cancelled (spec §4.1).
    pub async fn sweep_stale(&self) -> Vec<CommandId> {
        let mut inner = self.inner.lock().await;
        let stale_after = std::time::Duration::from_secs(self.config.stale_command_timeout_seconds);
        let now = Instant::now();
        let mut removed = Vec::new();
        for lane in inner.lanes.values_mut() {
            let mut i = 0;
            while i < lane.len() {
                if now.duration_since(lane[i].queued_since) > stale_after {
                    let entry = lane.remove(i).unwrap();
                    removed.push(entry.command.id);
                } else {
                    i += 1;
                }
            }
        }
        for id in &removed {
            inner.index.remove(id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_types::CommandCategory;

    fn cmd(priority: CommandPriority) -> Command {
        Command::new("test", CommandCategory::System, priority)
    }

    #[tokio::test]
    async fn emergency_dispatches_before_normal_when_both_allowed() {
        let q = PriorityQueue::new(QueueConfig::default());
        q.enqueue(cmd(CommandPriority::Normal)).await.unwrap();
        q.enqueue(cmd(CommandPriority::Emergency)).await.unwrap();

        let outcome = q.dequeue(&[CommandPriority::Emergency, CommandPriority::Normal]).await;
        assert_eq!(outcome.dispatched.unwrap().priority, CommandPriority::Emergency);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let q = PriorityQueue::new(QueueConfig::default());
        let first = cmd(CommandPriority::Normal);
        let second = cmd(CommandPriority::Normal);
        let first_id = first.id;
        q.enqueue(first).await.unwrap();
        q.enqueue(second).await.unwrap();

        let outcome = q.dequeue(&[CommandPriority::Normal]).await;
        assert_eq!(outcome.dispatched.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn enqueue_over_capacity_fails_without_side_effects() {
        let mut config = QueueConfig::default();
        config.max_queue_size = 1;
        let q = PriorityQueue::new(config);
        q.enqueue(cmd(CommandPriority::Normal)).await.unwrap();
        let err = q.enqueue(cmd(CommandPriority::Normal)).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { capacity: 1 });
        assert_eq!(q.stats().await.total_enqueued, 1);
    }

    #[tokio::test]
    async fn enqueue_into_shutdown_queue_fails() {
        let q = PriorityQueue::new(QueueConfig::default());
        q.shutdown().await;
        let err = q.enqueue(cmd(CommandPriority::Normal)).await.unwrap_err();
        assert_eq!(err, AdmissionError::Shutdown);
    }

    #[tokio::test]
    async fn cancel_removes_queued_command() {
        let q = PriorityQueue::new(QueueConfig::default());
        let command = cmd(CommandPriority::Low);
        let id = command.id;
        q.enqueue(command).await.unwrap();
        assert!(q.cancel(id).await);
        assert!(q.dequeue(&[CommandPriority::Low]).await.dispatched.is_none());
    }

    #[tokio::test]
    async fn requeue_counts_retry_exactly_once() {
        let q = PriorityQueue::new(QueueConfig::default());
        let mut command = cmd(CommandPriority::Normal);
        command.transition_to(CommandStatus::Queued).unwrap();
        command.transition_to(CommandStatus::Executing).unwrap();
        let retry_count_before = command.retry_count;
        q.requeue(command, None).await.unwrap();
        let inner = q.inner.lock().await;
        assert_eq!(inner.retry_timestamps.len(), 1);
        drop(inner);
        let outcome = q.dequeue(&[CommandPriority::Normal]).await;
        assert_eq!(outcome.dispatched.unwrap().retry_count, retry_count_before + 1);
    }
}
