use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cq_core::{
    backoff_delay_ms, AckStatistics, AcknowledgmentTracker, DequeueOutcome, EventSink, PersistencePort, PriorityQueue,
    QueueStatistics,
};
use cq_types::{
    Command, CommandEvent, CommandId, CommandPriority, CommandResult, CommandStatus, EventType, HandlerError,
    ResultErrorKind,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handler::{CommandHandler, ProgressCallback};

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub emergency_concurrency: usize,
    pub high_concurrency: usize,
    pub normal_concurrency: usize,
    pub low_concurrency: usize,
    pub global_concurrency: usize,
    pub scheduler_tick_ms: u64,
    pub health_report_interval_seconds: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            emergency_concurrency: 3,
            high_concurrency: 2,
            normal_concurrency: 1,
            low_concurrency: 1,
            global_concurrency: 5,
            scheduler_tick_ms: 50,
            health_report_interval_seconds: 30,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

impl ProcessorConfig {
    fn cap(&self, priority: CommandPriority) -> usize {
        match priority {
            CommandPriority::Emergency => self.emergency_concurrency,
            CommandPriority::High => self.high_concurrency,
            CommandPriority::Normal => self.normal_concurrency,
            CommandPriority::Low => self.low_concurrency,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorStatus {
    Stopped,
    Running,
    Paused,
}

#[derive(Clone, Debug)]
pub struct ProcessorHealth {
    pub status: ProcessorStatus,
    pub degraded: bool,
    pub queue: QueueStatistics,
    pub acks: AckStatistics,
}

struct Handles {
    scheduler: Option<tokio::task::JoinHandle<()>>,
    health: Option<tokio::task::JoinHandle<()>>,
    workers: JoinSet<()>,
}

/// Dispatches ready commands to registered [`CommandHandler`]s under
/// per-priority concurrency caps, retrying failures with backoff and
/// recovering in-flight work on startup (spec §4.4). The per-priority caps
/// default to favouring Emergency traffic, matching spec §4.4's stated
/// rationale that a stuck low-priority handler must never starve a safety
/// command.
pub struct Processor {
    queue: Arc<PriorityQueue>,
    persistence: Arc<dyn PersistencePort>,
    acks: Arc<AcknowledgmentTracker>,
    events: Arc<dyn EventSink>,
    config: ProcessorConfig,
    handlers: Mutex<Vec<Arc<dyn CommandHandler>>>,
    default_handler: Mutex<Option<Arc<dyn CommandHandler>>>,
    in_flight: Mutex<HashMap<CommandPriority, usize>>,
    status: Mutex<ProcessorStatus>,
    degraded: AtomicBool,
    token: CancellationToken,
    handles: Mutex<Handles>,
}

impl Processor {
    pub fn new(
        queue: Arc<PriorityQueue>,
        persistence: Arc<dyn PersistencePort>,
        acks: Arc<AcknowledgmentTracker>,
        events: Arc<dyn EventSink>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        let in_flight = CommandPriority::ALL.into_iter().map(|p| (p, 0)).collect();
        Arc::new(Self {
            queue,
            persistence,
            acks,
            events,
            config,
            handlers: Mutex::new(Vec::new()),
            default_handler: Mutex::new(None),
            in_flight: Mutex::new(in_flight),
            status: Mutex::new(ProcessorStatus::Stopped),
            degraded: AtomicBool::new(false),
            token: CancellationToken::new(),
            handles: Mutex::new(Handles { scheduler: None, health: None, workers: JoinSet::new() }),
        })
    }

    pub async fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.lock().await.push(handler);
    }

    /// Submits a command for admission onto the underlying priority queue.
    pub async fn submit(&self, command: Command) -> Result<(), cq_types::AdmissionError> {
        if let Err(e) = self.persistence.save(&command).await {
            warn!(error = %e, "persistence degraded while saving a newly submitted command");
        }
        let (id, priority, type_name) = (command.id, command.priority, command.type_name.clone());
        self.queue.enqueue(command).await?;
        self.events
            .emit(CommandEvent::for_command(EventType::CommandQueued, id, CommandStatus::Queued, priority, type_name))
            .await;
        Ok(())
    }

    pub async fn set_default_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.default_handler.lock().await = Some(handler);
    }

    pub async fn health(&self) -> ProcessorHealth {
        ProcessorHealth {
            status: *self.status.lock().await,
            degraded: self.degraded.load(Ordering::Relaxed),
            queue: self.queue.stats().await,
            acks: self.acks.stats().await,
        }
    }

    /// Replays commands that were durable but not yet terminal at the last
    /// clean shutdown. A command still `Executing` means the process died
    /// mid-handler — there is no way to know how far it got, so it is
    /// surfaced as Failed rather than silently re-run (spec §4.4).
    pub async fn recover(&self) {
        let pending = match self.persistence.load_pending().await {
            Ok(p) => p,
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                error!(error = %e, "startup recovery could not load pending commands");
                return;
            }
        };
        for mut command in pending {
            if command.status == CommandStatus::Executing {
                command.status = CommandStatus::Failed;
                let result = CommandResult::failure(
                    command.id,
                    CommandStatus::Failed,
                    ResultErrorKind::Exception,
                    "command was executing when the process restarted",
                );
                let _ = self.persistence.update_status(command.id, CommandStatus::Failed, Some(result)).await;
                self.events
                    .emit(CommandEvent::for_command(
                        EventType::CommandFailed,
                        command.id,
                        CommandStatus::Failed,
                        command.priority,
                        command.type_name.clone(),
                    ))
                    .await;
                continue;
            }
            command.queued_at = None;
            if let Err(e) = self.queue.enqueue(command).await {
                warn!(error = %e, "could not re-admit a recovered command");
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        self.recover().await;
        *self.status.lock().await = ProcessorStatus::Running;

        let scheduler = {
            let processor = Arc::clone(self);
            tokio::spawn(async move { processor.run_scheduler().await })
        };
        let health = {
            let processor = Arc::clone(self);
            tokio::spawn(async move { processor.run_health_monitor().await })
        };

        let mut handles = self.handles.lock().await;
        handles.scheduler = Some(scheduler);
        handles.health = Some(health);
    }

    pub async fn stop(&self) {
        self.token.cancel();
        *self.status.lock().await = ProcessorStatus::Stopped;
        self.queue.shutdown().await;

        let mut handles = self.handles.lock().await;
        if let Some(h) = handles.scheduler.take() {
            let _ = h.await;
        }
        if let Some(h) = handles.health.take() {
            let _ = h.await;
        }
        while handles.workers.join_next().await.is_some() {}
    }

    pub async fn pause(&self) {
        *self.status.lock().await = ProcessorStatus::Paused;
    }

    pub async fn resume(&self) {
        *self.status.lock().await = ProcessorStatus::Running;
    }

    pub async fn status(&self) -> ProcessorStatus {
        *self.status.lock().await
    }

    async fn available_priorities(&self) -> Vec<CommandPriority> {
        let in_flight = self.in_flight.lock().await;
        let global: usize = in_flight.values().sum();
        if global >= self.config.global_concurrency {
            return Vec::new();
        }
        CommandPriority::dispatch_order()
            .filter(|p| in_flight.get(p).copied().unwrap_or(0) < self.config.cap(*p))
            .collect()
    }

    async fn run_scheduler(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(self.config.scheduler_tick_ms)) => {
                    if *self.status.lock().await != ProcessorStatus::Running {
                        continue;
                    }
                    for command in self.queue.sweep_timeouts().await {
                        self.handle_queue_timeout(command).await;
                    }
                    let allowed = self.available_priorities().await;
                    if allowed.is_empty() {
                        continue;
                    }
                    let DequeueOutcome { dispatched, timed_out } = self.queue.dequeue(&allowed).await;
                    for command in timed_out {
                        self.handle_queue_timeout(command).await;
                    }
                    if let Some(command) = dispatched {
                        self.dispatch(command).await;
                    }
                }
            }
        }
    }

    async fn handle_queue_timeout(&self, command: Command) {
        let result = CommandResult::failure(
            command.id,
            CommandStatus::Timeout,
            ResultErrorKind::Deadline,
            "command exceeded its queue wait timeout",
        );
        if let Err(e) = self.persistence.update_status(command.id, CommandStatus::Timeout, Some(result)).await {
            warn!(error = %e, command_id = %command.id, "failed to persist queue timeout");
        }
        self.events
            .emit(CommandEvent::for_command(
                EventType::CommandFailed,
                command.id,
                CommandStatus::Timeout,
                command.priority,
                command.type_name,
            ))
            .await;
    }

    async fn dispatch(self: &Arc<Self>, command: Command) {
        *self.in_flight.lock().await.entry(command.priority).or_insert(0) += 1;
        let processor = Arc::clone(self);
        let mut handles = self.handles.lock().await;
        handles.workers.spawn(async move {
            processor.run_command(command.clone()).await;
            *processor.in_flight.lock().await.entry(command.priority).or_insert(1) -= 1;
        });
    }

    async fn run_command(self: &Arc<Self>, command: Command) {
        let handler = self.resolve_handler(&command).await;
        let Some(handler) = handler else {
            warn!(command_id = %command.id, type_name = %command.type_name, "no handler registered for command type");
            let result = CommandResult::failure(
                command.id,
                CommandStatus::Failed,
                ResultErrorKind::Precondition,
                "no handler registered for this command type",
            );
            let _ = self.persistence.update_status(command.id, CommandStatus::Failed, Some(result)).await;
            return;
        };

        self.acks.create_ack(&command).await;
        self.acks.acknowledge(command.id).await;
        if let Err(e) = self.persistence.update_status(command.id, CommandStatus::Executing, None).await {
            self.degraded.store(true, Ordering::Relaxed);
            warn!(error = %e, "persistence degraded while marking command executing");
        }
        self.events
            .emit(CommandEvent::for_command(
                EventType::CommandStarted,
                command.id,
                CommandStatus::Executing,
                command.priority,
                command.type_name.clone(),
            ))
            .await;
        handler.on_before(&command).await;

        let progress = self.progress_callback(command.id);
        let outcome = tokio::time::timeout(
            Duration::from_millis(command.timeout_ms),
            handler.handle(&command, progress),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                self.acks.complete(command.id, result.clone()).await;
                self.queue.complete(command.id).await;
                let status = if result.success { CommandStatus::Completed } else { CommandStatus::Failed };
                let _ = self.persistence.update_status(command.id, status, Some(result.clone())).await;
                handler.on_after(&command, &result).await;
                self.events
                    .emit(CommandEvent::for_command(
                        if result.success { EventType::CommandCompleted } else { EventType::CommandFailed },
                        command.id,
                        status,
                        command.priority,
                        command.type_name,
                    ))
                    .await;
            }
            Ok(Err(handler_error)) => {
                handler.on_error(&command, &handler_error).await;
                self.finish_with_error(command, handler_error).await;
            }
            Err(_elapsed) => {
                handler.on_error(&command, &HandlerError::Deadline).await;
                self.finish_with_error(command, HandlerError::Deadline).await;
            }
        }
    }

    async fn finish_with_error(&self, mut command: Command, error: HandlerError) {
        if command.retry_count < command.max_retries {
            let delay_ms = backoff_delay_ms(self.config.retry_base_ms, command.retry_count, self.config.retry_max_ms);
            self.acks.handle_retry(command.id).await;
            self.events
                .emit(
                    CommandEvent::for_command(
                        EventType::CommandRetrying,
                        command.id,
                        CommandStatus::Retrying,
                        command.priority,
                        command.type_name.clone(),
                    )
                    .with_extra("delay_ms", serde_json::json!(delay_ms)),
                )
                .await;
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                command.transition_to(CommandStatus::Retrying).ok();
                let _ = queue.requeue(command, None).await;
            });
        } else {
            let result = handler_error_result(command.id, &error);
            self.acks.complete(command.id, result.clone()).await;
            self.queue.complete(command.id).await;
            let _ = self.persistence.update_status(command.id, CommandStatus::Failed, Some(result)).await;
            self.events
                .emit(CommandEvent::for_command(
                    EventType::CommandFailed,
                    command.id,
                    CommandStatus::Failed,
                    command.priority,
                    command.type_name,
                ))
                .await;
        }
    }

    async fn resolve_handler(&self, command: &Command) -> Option<Arc<dyn CommandHandler>> {
        let handlers = self.handlers.lock().await;
        if let Some(handler) = handlers.iter().find(|h| h.can_handle(command)) {
            return Some(Arc::clone(handler));
        }
        drop(handlers);
        self.default_handler.lock().await.clone()
    }

    fn progress_callback(self: &Arc<Self>, command_id: CommandId) -> ProgressCallback {
        let processor = Arc::clone(self);
        Arc::new(move |progress, message| {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                processor.acks.update_progress(command_id, progress, message).await;
            });
        })
    }

    async fn run_health_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.health_report_interval_seconds));
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    let queue_stats = self.queue.stats().await;
                    let ack_stats = self.acks.stats().await;
                    info!(
                        enqueued = queue_stats.total_enqueued,
                        dequeued = queue_stats.total_dequeued,
                        completed = ack_stats.completed,
                        failed = ack_stats.failed,
                        degraded = self.degraded.load(Ordering::Relaxed),
                        "processor health report"
                    );
                }
            }
        }
    }
}

fn handler_error_result(command_id: CommandId, error: &HandlerError) -> CommandResult {
    let kind = match error {
        HandlerError::Deadline => ResultErrorKind::Deadline,
        HandlerError::Precondition { .. } => ResultErrorKind::Precondition,
        HandlerError::Exception { .. } => ResultErrorKind::Exception,
    };
    CommandResult::failure(command_id, CommandStatus::Failed, kind, error.to_string())
}
