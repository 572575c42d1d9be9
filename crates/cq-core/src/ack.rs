use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cq_types::{
    AckStatus, Acknowledgment, CommandEvent, CommandId, CommandPriority, CommandResult, CommandStatus, EventType,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::retry::backoff_delay_ms;
use crate::sink::EventSink;

#[derive(Clone, Debug)]
pub struct AckConfig {
    pub ack_timeout_ms: u64,
    pub ack_retry_delay_ms: u64,
    pub max_ack_retries: u32,
    pub max_backoff_ms: u64,
    pub result_cache_ttl_seconds: i64,
    pub max_cached_results: usize,
    /// How often the tracker autonomously re-emits the current progress for
    /// an in-flight command, so event consumers stay live between a
    /// handler's own progress reports (spec §4.3 "Progress tracking").
    pub progress_update_interval_ms: u64,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            ack_retry_delay_ms: 1_000,
            max_ack_retries: 3,
            max_backoff_ms: 30_000,
            result_cache_ttl_seconds: 300,
            max_cached_results: 1000,
            progress_update_interval_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AckStatistics {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub avg_ack_latency_ms: f64,
    pub avg_execution_latency_ms: f64,
}

struct CachedResult {
    result: CommandResult,
    cached_at: chrono::DateTime<Utc>,
}

struct Meta {
    priority: CommandPriority,
    type_name: String,
}

struct Inner {
    acks: HashMap<CommandId, Acknowledgment>,
    meta: HashMap<CommandId, Meta>,
    results: HashMap<CommandId, CachedResult>,
    timers: HashMap<CommandId, JoinHandle<()>>,
    progress_timers: HashMap<CommandId, JoinHandle<()>>,
    stats: AckStatistics,
}

/// Progress/ack/timeout/retry state per in-flight command (spec §4.3).
/// Owns a table guarded by a single mutex, per the concurrency model's
/// "acknowledgment table: single mutex per-map" guidance.
pub struct AcknowledgmentTracker {
    config: AckConfig,
    events: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
}

impl AcknowledgmentTracker {
    pub fn new(config: AckConfig, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            inner: Mutex::new(Inner {
                acks: HashMap::new(),
                meta: HashMap::new(),
                results: HashMap::new(),
                timers: HashMap::new(),
                progress_timers: HashMap::new(),
                stats: AckStatistics::default(),
            }),
        })
    }

    /// Allocates a tracking id and arms the ack-timeout timer described in
    /// spec §4.3: if the command is not acknowledged before the timer
    /// fires, the ack-retry counter increments and the timer is rescheduled
    /// with exponential backoff until `max_ack_retries` is exhausted, at
    /// which point the command transitions to Timeout. Emits `CommandQueued`
    /// is the caller's responsibility (queueing happens before an ack
    /// exists); this only records the priority/type_name needed to label
    /// the progress events this tracker later emits.
    pub async fn create_ack(self: &Arc<Self>, command: &cq_types::Command) -> Acknowledgment {
        let ack = Acknowledgment::new(command.id);
        {
            let mut inner = self.inner.lock().await;
            inner.acks.insert(command.id, ack.clone());
            inner
                .meta
                .insert(command.id, Meta { priority: command.priority, type_name: command.type_name.clone() });
        }
        self.arm_timeout_timer(command.id, 0).await;
        debug!(command_id = %command.id, "acknowledgment created");
        ack
    }

    async fn arm_timeout_timer(self: &Arc<Self>, command_id: CommandId, attempt: u32) {
        let tracker = Arc::clone(self);
        let delay_ms = if attempt == 0 {
            tracker.config.ack_timeout_ms
        } else {
            backoff_delay_ms(tracker.config.ack_retry_delay_ms, attempt, tracker.config.max_backoff_ms)
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            tracker.on_timer_fired(command_id, attempt).await;
        });
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.timers.insert(command_id, handle) {
            old.abort();
        }
    }

    async fn on_timer_fired(self: Arc<Self>, command_id: CommandId, attempt: u32) {
        let mut inner = self.inner.lock().await;
        let Some(ack) = inner.acks.get_mut(&command_id) else { return };
        if ack.status != AckStatus::Pending {
            return;
        }
        if attempt + 1 > self.config.max_ack_retries {
            ack.status = AckStatus::Timeout;
            ack.completed_at = Some(Utc::now());
            inner.stats.timed_out += 1;
            warn!(command_id = %command_id, "acknowledgment timed out after max ack retries");
            return;
        }
        ack.ack_retry_count += 1;
        drop(inner);
        self.arm_timeout_timer(command_id, attempt + 1).await;
    }

    /// Marks a command Acknowledged and arms the autonomous progress
    /// re-emitter that keeps event consumers live between the handler's own
    /// `update_progress` calls (spec §4.3 "Progress tracking").
    pub async fn acknowledge(self: &Arc<Self>, command_id: CommandId) -> Option<()> {
        let mut inner = self.inner.lock().await;
        let ack = inner.acks.get_mut(&command_id)?;
        if ack.status != AckStatus::Pending {
            return None;
        }
        ack.status = AckStatus::Acknowledged;
        let now = Utc::now();
        let latency_ms = (now - ack.created_at).num_milliseconds().max(0) as f64;
        ack.acknowledged_at = Some(now);
        if let Some(handle) = inner.timers.remove(&command_id) {
            handle.abort();
        }
        inner.stats.avg_ack_latency_ms = ema(inner.stats.avg_ack_latency_ms, latency_ms);
        drop(inner);
        self.arm_progress_reemitter(command_id).await;
        Some(())
    }

    async fn arm_progress_reemitter(self: &Arc<Self>, command_id: CommandId) {
        let tracker = Arc::clone(self);
        let interval_ms = self.config.progress_update_interval_ms;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                let mut inner = tracker.inner.lock().await;
                let Some(ack) = inner.acks.get(&command_id) else { break };
                if ack.status.is_terminal() {
                    break;
                }
                if ack.status == AckStatus::Acknowledged || ack.status == AckStatus::InProgress {
                    let progress = ack.progress;
                    let message = ack.progress_message.clone();
                    let meta = inner.meta.get(&command_id).map(|m| (m.priority, m.type_name.clone()));
                    drop(inner);
                    if let Some((priority, type_name)) = meta {
                        tracker
                            .events
                            .emit(
                                CommandEvent::for_command(
                                    EventType::CommandProgress,
                                    command_id,
                                    CommandStatus::Executing,
                                    priority,
                                    type_name,
                                )
                                .with_extra("progress", serde_json::json!(progress))
                                .with_extra("message", serde_json::json!(message))
                                .with_extra("autonomous", serde_json::json!(true)),
                            )
                            .await;
                    }
                }
            }
        });
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.progress_timers.insert(command_id, handle) {
            old.abort();
        }
    }

    pub async fn update_progress(&self, command_id: CommandId, progress: f64, message: Option<String>) -> Option<()> {
        let (priority, type_name) = {
            let mut inner = self.inner.lock().await;
            let ack = inner.acks.get_mut(&command_id)?;
            if !matches!(ack.status, AckStatus::Acknowledged | AckStatus::InProgress) {
                return None;
            }
            ack.status = AckStatus::InProgress;
            ack.progress = progress.clamp(0.0, 1.0);
            ack.progress_message = message.clone();
            let meta = inner.meta.get(&command_id)?;
            (meta.priority, meta.type_name.clone())
        };
        self.events
            .emit(
                CommandEvent::for_command(EventType::CommandProgress, command_id, CommandStatus::Executing, priority, type_name)
                    .with_extra("progress", serde_json::json!(progress.clamp(0.0, 1.0)))
                    .with_extra("message", serde_json::json!(message)),
            )
            .await;
        Some(())
    }

    pub async fn complete(&self, command_id: CommandId, result: CommandResult) -> Option<()> {
        let mut inner = self.inner.lock().await;
        let ack = inner.acks.get_mut(&command_id)?;
        let now = Utc::now();
        let exec_latency_ms = ack
            .acknowledged_at
            .map(|t| (now - t).num_milliseconds().max(0) as f64)
            .unwrap_or(0.0);
        ack.status = if result.success { AckStatus::Completed } else { AckStatus::Failed };
        ack.completed_at = Some(now);
        ack.result = Some(result.clone());
        if result.success {
            inner.stats.completed += 1;
        } else {
            inner.stats.failed += 1;
        }
        inner.stats.avg_execution_latency_ms = ema(inner.stats.avg_execution_latency_ms, exec_latency_ms);
        if let Some(handle) = inner.timers.remove(&command_id) {
            handle.abort();
        }
        if let Some(handle) = inner.progress_timers.remove(&command_id) {
            handle.abort();
        }
        let max_cached = self.config.max_cached_results;
        evict_lru(&mut inner.results, max_cached.saturating_sub(1));
        inner.results.insert(command_id, CachedResult { result, cached_at: now });
        Some(())
    }

    pub async fn handle_timeout(&self, command_id: CommandId) -> Option<()> {
        let mut inner = self.inner.lock().await;
        let ack = inner.acks.get_mut(&command_id)?;
        if ack.status.is_terminal() {
            return None;
        }
        ack.status = AckStatus::Timeout;
        ack.completed_at = Some(Utc::now());
        inner.stats.timed_out += 1;
        if let Some(handle) = inner.timers.remove(&command_id) {
            handle.abort();
        }
        if let Some(handle) = inner.progress_timers.remove(&command_id) {
            handle.abort();
        }
        Some(())
    }

    pub async fn handle_retry(&self, command_id: CommandId) -> Option<()> {
        let mut inner = self.inner.lock().await;
        let ack = inner.acks.get_mut(&command_id)?;
        ack.progress = 0.0;
        ack.status = AckStatus::Retrying;
        Some(())
    }

    pub async fn get_ack(&self, command_id: CommandId) -> Option<Acknowledgment> {
        let inner = self.inner.lock().await;
        inner.acks.get(&command_id).cloned()
    }

    pub async fn get_cached_result(&self, command_id: CommandId) -> Option<CommandResult> {
        let inner = self.inner.lock().await;
        let cached = inner.results.get(&command_id)?;
        let ttl = chrono::Duration::seconds(self.config.result_cache_ttl_seconds);
        if Utc::now() - cached.cached_at > ttl {
            return None;
        }
        Some(cached.result.clone())
    }

    pub async fn stats(&self) -> AckStatistics {
        self.inner.lock().await.stats.clone()
    }

    /// Background sweep: drops acknowledgments whose completion predates
    /// `result_cache_ttl`, and trims the result cache to `max_cached_results`
    /// by LRU on completion time (spec §4.3).
    pub async fn sweep_expired(&self) {
        let mut inner = self.inner.lock().await;
        let ttl = chrono::Duration::seconds(self.config.result_cache_ttl_seconds);
        let now = Utc::now();
        inner.acks.retain(|_, ack| match ack.completed_at {
            Some(t) => now - t <= ttl,
            None => true,
        });
        let live: std::collections::HashSet<CommandId> = inner.acks.keys().copied().collect();
        inner.meta.retain(|id, _| live.contains(id));
        inner.results.retain(|_, cached| now - cached.cached_at <= ttl);
        let max_cached = self.config.max_cached_results;
        evict_lru(&mut inner.results, max_cached);
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    const ALPHA: f64 = 0.2;
    if current == 0.0 {
        sample
    } else {
        ALPHA * sample + (1.0 - ALPHA) * current
    }
}

fn evict_lru(results: &mut HashMap<CommandId, CachedResult>, max_len: usize) {
    while results.len() > max_len {
        if let Some(oldest) = results.iter().min_by_key(|(_, v)| v.cached_at).map(|(k, _)| *k) {
            results.remove(&oldest);
        } else {
            break;
        }
    }
}
