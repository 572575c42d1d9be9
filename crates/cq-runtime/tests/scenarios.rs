use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cq_core::batch::{BatchExecutionConfig, BatchExecutor, CommandExecutor, CompensatingAction};
use cq_core::{AckConfig, AcknowledgmentTracker, InMemoryPersistence, NullEventSink, PersistenceConfig, PersistencePort, PriorityQueue, QueueConfig};
use cq_runtime::{CommandHandler, ProgressCallback, Processor, ProcessorConfig};
use cq_types::{
    BatchExecutionMode, BatchTransactionMode, Command, CommandCategory, CommandPriority, CommandResult, CommandStatus,
    HandlerError,
};

fn build_processor(config: ProcessorConfig) -> (Arc<Processor>, Arc<InMemoryPersistence>) {
    let queue = Arc::new(PriorityQueue::new(QueueConfig::default()));
    let persistence = Arc::new(InMemoryPersistence::new(PersistenceConfig::default()));
    let events = Arc::new(NullEventSink);
    let acks = AcknowledgmentTracker::new(AckConfig::default(), events.clone());
    let processor = Processor::new(queue, Arc::clone(&persistence) as _, acks, events, config);
    (processor, persistence)
}

struct ScenarioAHandler {
    normal_starts: Arc<StdMutex<Vec<Instant>>>,
    emergency_starts: Arc<StdMutex<Vec<Instant>>>,
}

#[async_trait]
impl CommandHandler for ScenarioAHandler {
    fn can_handle(&self, _command: &Command) -> bool {
        true
    }

    async fn handle(&self, command: &Command, _progress: ProgressCallback) -> Result<CommandResult, HandlerError> {
        if command.priority == CommandPriority::Emergency {
            self.emergency_starts.lock().unwrap().push(Instant::now());
            Ok(CommandResult::success(command.id, CommandStatus::Completed, None, 0))
        } else {
            self.normal_starts.lock().unwrap().push(Instant::now());
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(CommandResult::success(command.id, CommandStatus::Completed, None, 100))
        }
    }
}

/// Scenario A — Emergency preemption: a burst of slow Normal work must
/// never delay an Emergency command behind the whole Normal backlog.
#[tokio::test]
async fn emergency_preempts_a_saturated_normal_backlog() {
    let mut config = ProcessorConfig::default();
    config.normal_concurrency = 1;
    config.emergency_concurrency = 1;
    config.global_concurrency = 2;
    config.scheduler_tick_ms = 5;
    let (processor, _persistence) = build_processor(config);

    let normal_starts = Arc::new(StdMutex::new(Vec::new()));
    let emergency_starts = Arc::new(StdMutex::new(Vec::new()));
    processor
        .register_handler(Arc::new(ScenarioAHandler {
            normal_starts: Arc::clone(&normal_starts),
            emergency_starts: Arc::clone(&emergency_starts),
        }))
        .await;
    processor.start().await;

    let t0 = Instant::now();
    for _ in 0..5 {
        let command = Command::new("patrol", CommandCategory::Movement, CommandPriority::Normal);
        processor.submit(command).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let emergency = Command::new("emergency_stop", CommandCategory::System, CommandPriority::Emergency);
    processor.submit(emergency).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    processor.stop().await;

    let emergency_started_at = emergency_starts.lock().unwrap().first().copied();
    let emergency_started_at = emergency_started_at.expect("emergency command should have started");
    let elapsed = emergency_started_at.duration_since(t0);
    assert!(elapsed < Duration::from_millis(80), "emergency command took {elapsed:?} to start, expected well under 500ms of normal-queue draining");
}

struct FlakyHandler {
    fail_first: usize,
    attempts: Arc<AtomicUsize>,
    attempt_times: Arc<StdMutex<Vec<Instant>>>,
}

#[async_trait]
impl CommandHandler for FlakyHandler {
    fn can_handle(&self, _command: &Command) -> bool {
        true
    }

    async fn handle(&self, command: &Command, _progress: ProgressCallback) -> Result<CommandResult, HandlerError> {
        self.attempt_times.lock().unwrap().push(Instant::now());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(HandlerError::Exception { message: "transient failure".into() });
        }
        Ok(CommandResult::success(command.id, CommandStatus::Completed, None, 1))
    }
}

/// Scenario C — retries back off exponentially and the command completes
/// once the handler finally succeeds.
#[tokio::test]
async fn retry_backs_off_exponentially_then_succeeds() {
    let mut config = ProcessorConfig::default();
    config.normal_concurrency = 1;
    config.global_concurrency = 1;
    config.scheduler_tick_ms = 5;
    config.retry_base_ms = 20;
    config.retry_max_ms = 1000;
    let (processor, persistence) = build_processor(config);

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempt_times = Arc::new(StdMutex::new(Vec::new()));
    processor
        .register_handler(Arc::new(FlakyHandler {
            fail_first: 3,
            attempts: Arc::clone(&attempts),
            attempt_times: Arc::clone(&attempt_times),
        }))
        .await;
    processor.start().await;

    let mut command = Command::new("calibrate", CommandCategory::Calibration, CommandPriority::Normal);
    command.max_retries = 3;
    let command_id = command.id;
    processor.submit(command).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    processor.stop().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4, "handler should run once then retry 3 times");
    let saved = persistence.get(command_id).await.unwrap().unwrap();
    assert_eq!(saved.status, CommandStatus::Completed);

    let times = attempt_times.lock().unwrap();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1].duration_since(w[0])).collect();
    assert!(gaps[0] >= Duration::from_millis(15), "first gap {:?} should be roughly base delay", gaps[0]);
    assert!(gaps[1] >= gaps[0], "gaps should widen with each retry");
    assert!(gaps[2] >= gaps[1], "gaps should keep widening with each retry");
}

struct SlowHandler {
    sleep_ms: u64,
}

#[async_trait]
impl CommandHandler for SlowHandler {
    fn can_handle(&self, _command: &Command) -> bool {
        true
    }

    async fn handle(&self, command: &Command, _progress: ProgressCallback) -> Result<CommandResult, HandlerError> {
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Ok(CommandResult::success(command.id, CommandStatus::Completed, None, self.sleep_ms))
    }
}

/// Scenario D — a command stuck behind a saturated priority level times
/// out of the queue without ever reaching Executing.
#[tokio::test]
async fn saturated_level_times_out_the_queued_command() {
    let mut config = ProcessorConfig::default();
    config.normal_concurrency = 1;
    config.global_concurrency = 1;
    config.scheduler_tick_ms = 5;
    let (processor, persistence) = build_processor(config);

    processor.register_handler(Arc::new(SlowHandler { sleep_ms: 300 })).await;
    processor.start().await;

    let occupying = Command::new("long_scan", CommandCategory::SensorRead, CommandPriority::Normal);
    processor.submit(occupying).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let mut waiting = Command::new("quick_ping", CommandCategory::System, CommandPriority::Normal);
    waiting.queue_timeout_ms = 50;
    let waiting_id = waiting.id;
    processor.submit(waiting).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    processor.stop().await;

    let saved = persistence.get(waiting_id).await.unwrap().unwrap();
    assert_eq!(saved.status, CommandStatus::Timeout);
    assert!(saved.started_at.is_none(), "a timed-out command must never have entered Executing");
}

struct StepExecutor;

#[async_trait]
impl CommandExecutor for StepExecutor {
    async fn execute(&self, command: Command) -> CommandResult {
        let step = command.parameters.get("step").and_then(|v| v.as_i64()).unwrap_or(0);
        if step == 3 {
            CommandResult::failure(command.id, CommandStatus::Failed, cq_types::ResultErrorKind::Exception, "motor stall")
        } else {
            CommandResult::success(command.id, CommandStatus::Completed, None, 1)
        }
    }
}

struct InverseMoveAction {
    order: Arc<StdMutex<Vec<i64>>>,
}

#[async_trait]
impl CompensatingAction for InverseMoveAction {
    fn action_type(&self) -> &str {
        "inverse_move_forward"
    }

    async fn execute(&self, command: &Command) -> Option<Command> {
        let step = command.parameters.get("step").and_then(|v| v.as_i64()).unwrap_or(0);
        self.order.lock().unwrap().push(step);
        let mut inverse = Command::new("move_backward", CommandCategory::Movement, command.priority);
        inverse.parameters.insert("step".into(), serde_json::json!(step));
        Some(inverse)
    }
}

/// Scenario F — an AllOrNothing batch rolls back completed members in
/// reverse completion order when a later member fails.
#[tokio::test]
async fn all_or_nothing_batch_rolls_back_in_reverse_completion_order() {
    let executor = BatchExecutor::new(BatchExecutionConfig::default(), Arc::new(StepExecutor), Arc::new(NullEventSink));
    let order = Arc::new(StdMutex::new(Vec::new()));
    executor
        .register_compensating_action("move_forward", Arc::new(InverseMoveAction { order: Arc::clone(&order) }))
        .await;

    let mut m1 = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
    m1.parameters.insert("step".into(), serde_json::json!(1));
    let mut m2 = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
    m2.parameters.insert("step".into(), serde_json::json!(2));
    let mut m3 = Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal);
    m3.parameters.insert("step".into(), serde_json::json!(3));

    let batch = executor
        .create_batch(
            "drive-sequence",
            vec![m1, m2, m3],
            Vec::new(),
            BatchExecutionMode::Sequential,
            BatchTransactionMode::AllOrNothing,
            CommandPriority::Normal,
            true,
        )
        .await
        .unwrap();

    let finished = executor.execute_batch(batch.id).await.unwrap();

    assert_eq!(finished.status, cq_types::BatchStatus::RolledBack);
    assert_eq!(finished.completed_commands, 2);
    assert_eq!(finished.failed_commands, 1);
    assert_eq!(*order.lock().unwrap(), vec![2, 1], "rollback must replay in reverse completion order");
}
