use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cq_types::{
    Batch, BatchDependency, BatchError, BatchExecutionMode, BatchId, BatchStatus, BatchTransactionMode, Command,
    CommandCategory, CommandId, CommandPriority, CommandResult, EventType,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::sink::EventSink;

/// Runs a single command to completion, bypassing the priority queue's own
/// admission/dispatch rules — batch members are scheduled by the batch's
/// own execution mode, not the global scheduler (spec §4.7).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> CommandResult;
}

#[async_trait]
pub trait CompensatingAction: Send + Sync {
    fn action_type(&self) -> &str;
    async fn validate(&self, _command: &Command) -> bool {
        true
    }
    async fn execute(&self, command: &Command) -> Option<Command>;
}

#[async_trait]
pub trait BatchCompletionCallback: Send + Sync {
    async fn on_complete(&self, batch: &Batch);
}

#[derive(Clone, Debug)]
pub struct BatchExecutionConfig {
    pub max_batch_size: usize,
    pub parallel_execution_limit: usize,
    pub rollback_timeout_seconds: u64,
    pub max_dependency_depth: usize,
}

impl Default for BatchExecutionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            parallel_execution_limit: 10,
            rollback_timeout_seconds: 300,
            max_dependency_depth: 10,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BatchStatistics {
    pub total_batches: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub avg_batch_size: f64,
    pub avg_execution_time_ms: f64,
}

/// Blueprint for one batch member, resolved against caller-supplied
/// parameter overrides when a batch is instantiated from a template.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub type_name: String,
    pub category: CommandCategory,
    pub priority: CommandPriority,
    pub parameters: HashMap<String, Value>,
}

#[derive(Clone, Debug)]
pub struct BatchTemplate {
    pub name: String,
    pub specs: Vec<CommandSpec>,
    pub dependencies: Vec<(usize, usize)>,
    pub execution_mode: BatchExecutionMode,
    pub transaction_mode: BatchTransactionMode,
}

struct Inner {
    batches: HashMap<BatchId, Batch>,
    templates: HashMap<String, BatchTemplate>,
    stats: BatchStatistics,
}

fn ema(current: f64, sample: f64) -> f64 {
    const ALPHA: f64 = 0.2;
    if current == 0.0 {
        sample
    } else {
        ALPHA * sample + (1.0 - ALPHA) * current
    }
}

/// Multi-command transactions with dependency-aware scheduling and
/// best-effort rollback (spec §4.7). Grounded on the source's
/// `BatchExecutor`: dependency validation (cycle + depth), the three
/// execution modes, and the four transaction modes are carried over as
/// named concepts; member dispatch goes through [`CommandExecutor`] rather
/// than a direct processor reference, keeping this crate runtime-agnostic.
pub struct BatchExecutor {
    config: BatchExecutionConfig,
    executor: Arc<dyn CommandExecutor>,
    events: Arc<dyn EventSink>,
    compensators: Mutex<HashMap<String, Arc<dyn CompensatingAction>>>,
    callbacks: Mutex<Vec<Arc<dyn BatchCompletionCallback>>>,
    inner: Mutex<Inner>,
}

impl BatchExecutor {
    pub fn new(config: BatchExecutionConfig, executor: Arc<dyn CommandExecutor>, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            executor,
            events,
            compensators: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                batches: HashMap::new(),
                templates: HashMap::new(),
                stats: BatchStatistics::default(),
            }),
        }
    }

    pub async fn register_compensating_action(&self, type_name: impl Into<String>, action: Arc<dyn CompensatingAction>) {
        self.compensators.lock().await.insert(type_name.into(), action);
    }

    pub async fn register_completion_callback(&self, callback: Arc<dyn BatchCompletionCallback>) {
        self.callbacks.lock().await.push(callback);
    }

    pub async fn stats(&self) -> BatchStatistics {
        self.inner.lock().await.stats.clone()
    }

    pub async fn get_batch(&self, id: BatchId) -> Option<Batch> {
        self.inner.lock().await.batches.get(&id).cloned()
    }

    pub async fn list_batches(&self) -> Vec<Batch> {
        self.inner.lock().await.batches.values().cloned().collect()
    }

    pub async fn save_template(&self, template: BatchTemplate) {
        self.inner.lock().await.templates.insert(template.name.clone(), template);
    }

    pub async fn create_batch_from_template(
        &self,
        template_name: &str,
        priority: CommandPriority,
        overrides: &HashMap<usize, HashMap<String, Value>>,
    ) -> Result<Batch, BatchError> {
        let template = {
            let inner = self.inner.lock().await;
            inner
                .templates
                .get(template_name)
                .cloned()
                .ok_or_else(|| BatchError::ModeConstraintViolation {
                    reason: format!("no template named {template_name}"),
                })?
        };

        let commands: Vec<Command> = template
            .specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut command = Command::new(spec.type_name.clone(), spec.category.clone(), spec.priority);
                command.parameters = spec.parameters.clone();
                if let Some(extra) = overrides.get(&i) {
                    command.parameters.extend(extra.clone());
                }
                command
            })
            .collect();

        let dependencies = template
            .dependencies
            .iter()
            .map(|(from, to)| BatchDependency {
                from_command_id: commands[*from].id,
                to_command_id: commands[*to].id,
            })
            .collect();

        self.create_batch(
            template.name.clone(),
            commands,
            dependencies,
            template.execution_mode,
            template.transaction_mode,
            priority,
            false,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_batch(
        &self,
        name: impl Into<String>,
        commands: Vec<Command>,
        dependencies: Vec<BatchDependency>,
        execution_mode: BatchExecutionMode,
        transaction_mode: BatchTransactionMode,
        priority: CommandPriority,
        rollback_on_failure: bool,
    ) -> Result<Batch, BatchError> {
        if commands.len() > self.config.max_batch_size {
            return Err(BatchError::SizeExceeded {
                size: commands.len(),
                max: self.config.max_batch_size,
            });
        }

        let ids: HashSet<CommandId> = commands.iter().map(|c| c.id).collect();
        for dep in &dependencies {
            if !ids.contains(&dep.from_command_id) {
                return Err(BatchError::UnknownReference { command_id: dep.from_command_id });
            }
            if !ids.contains(&dep.to_command_id) {
                return Err(BatchError::UnknownReference { command_id: dep.to_command_id });
            }
        }

        if execution_mode == BatchExecutionMode::Parallel && !dependencies.is_empty() {
            return Err(BatchError::ModeConstraintViolation {
                reason: "parallel mode does not support dependency ordering".into(),
            });
        }

        let mut batch = Batch::new(name, commands, execution_mode, transaction_mode, priority);
        batch.dependencies = dependencies;

        if has_cycle(&batch) {
            return Err(BatchError::CyclicDeps { batch_id: batch.id });
        }
        let depth = longest_dependency_chain(&batch);
        if depth > self.config.max_dependency_depth {
            return Err(BatchError::DepthExceeded {
                depth,
                max: self.config.max_dependency_depth,
            });
        }

        if transaction_mode == BatchTransactionMode::AllOrNothing && rollback_on_failure {
            let compensators = self.compensators.lock().await;
            for command in &batch.commands {
                if !compensators.contains_key(&command.type_name) {
                    return Err(BatchError::ModeConstraintViolation {
                        reason: format!("{} has no registered compensating action for rollback", command.type_name),
                    });
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.stats.total_batches += 1;
        inner.stats.avg_batch_size = ema(inner.stats.avg_batch_size, batch.total_commands as f64);
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    pub async fn cancel_batch(&self, id: BatchId) -> Result<(), BatchError> {
        let mut inner = self.inner.lock().await;
        let batch = inner.batches.get_mut(&id).ok_or(BatchError::NotFound { batch_id: id })?;
        if batch.status.is_terminal() {
            return Err(BatchError::NotPending { batch_id: id });
        }
        batch.status = BatchStatus::Cancelled;
        batch.completed_at = Some(Utc::now());
        Ok(())
    }

    pub async fn execute_batch(&self, id: BatchId) -> Result<Batch, BatchError> {
        let mut batch = {
            let inner = self.inner.lock().await;
            inner.batches.get(&id).cloned().ok_or(BatchError::NotFound { batch_id: id })?
        };
        if batch.status != BatchStatus::Pending {
            return Err(BatchError::NotPending { batch_id: id });
        }

        batch.status = BatchStatus::Executing;
        batch.started_at = Some(Utc::now());
        self.events
            .emit(cq_types::CommandEvent::for_batch(EventType::BatchEvent, id).with_extra("stage", serde_json::json!("started")))
            .await;

        let order: Vec<CommandId> = match batch.execution_mode {
            BatchExecutionMode::Sequential | BatchExecutionMode::Parallel => {
                batch.commands.iter().map(|c| c.id).collect()
            }
            BatchExecutionMode::Mixed => topological_layers(&batch).into_iter().flatten().collect(),
        };

        let completion_order = Mutex::new(Vec::new());
        let mut aborted = false;

        match batch.execution_mode {
            BatchExecutionMode::Parallel => {
                self.run_parallel(&mut batch, &order, &completion_order).await;
            }
            BatchExecutionMode::Sequential => {
                aborted = self.run_sequential(&mut batch, &order, &completion_order).await;
            }
            BatchExecutionMode::Mixed => {
                for layer in topological_layers(&batch) {
                    self.run_parallel(&mut batch, &layer, &completion_order).await;
                    if batch.transaction_mode == BatchTransactionMode::AllOrNothing && batch.failed_commands > 0 {
                        aborted = true;
                        break;
                    }
                    if batch.transaction_mode == BatchTransactionMode::StopOnError && batch.failed_commands > 0 {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        let should_rollback =
            (aborted || batch.failed_commands > 0) && batch.transaction_mode == BatchTransactionMode::AllOrNothing;

        if should_rollback {
            batch.status = BatchStatus::RollingBack;
            self.events
                .emit(cq_types::CommandEvent::for_batch(EventType::BatchEvent, id).with_extra("stage", serde_json::json!("batch_rollback_started")))
                .await;
            let order = completion_order.lock().await.clone();
            self.rollback(&mut batch, &order).await;
            batch.status = BatchStatus::RolledBack;
            self.events
                .emit(cq_types::CommandEvent::for_batch(EventType::BatchEvent, id).with_extra("stage", serde_json::json!("batch_rollback_completed")))
                .await;
        } else if batch.failed_commands == 0 {
            batch.status = BatchStatus::Completed;
        } else if batch.completed_commands > 0 {
            batch.status = BatchStatus::PartiallyCompleted;
        } else {
            batch.status = BatchStatus::Failed;
        }

        batch.completed_at = Some(Utc::now());
        let elapsed_ms = batch
            .started_at
            .and_then(|s| batch.completed_at.map(|e| (e - s).num_milliseconds().max(0) as f64))
            .unwrap_or(0.0);

        {
            let mut inner = self.inner.lock().await;
            inner.stats.avg_execution_time_ms = ema(inner.stats.avg_execution_time_ms, elapsed_ms);
            match batch.status {
                BatchStatus::Completed => inner.stats.completed += 1,
                BatchStatus::RolledBack => inner.stats.rolled_back += 1,
                _ => inner.stats.failed += 1,
            }
            inner.batches.insert(batch.id, batch.clone());
        }

        for callback in self.callbacks.lock().await.iter() {
            callback.on_complete(&batch).await;
        }

        Ok(batch)
    }

    async fn run_sequential(&self, batch: &mut Batch, order: &[CommandId], completion_order: &Mutex<Vec<CommandId>>) -> bool {
        for command_id in order {
            let command = batch.commands.iter().find(|c| c.id == *command_id).unwrap().clone();
            let result = self.executor.execute(command).await;
            let success = result.success;
            batch.command_results.insert(*command_id, result.clone());
            if success {
                batch.completed_commands += 1;
                completion_order.lock().await.push(*command_id);
            } else {
                batch.failed_commands += 1;
                batch.error_summary.push(result.error_message.clone().unwrap_or_default());
            }
            self.emit_batch_progress(batch).await;
            if !success {
                match batch.transaction_mode {
                    BatchTransactionMode::StopOnError | BatchTransactionMode::AllOrNothing => return true,
                    BatchTransactionMode::BestEffort | BatchTransactionMode::Isolated => {}
                }
            }
        }
        false
    }

    async fn run_parallel(&self, batch: &mut Batch, order: &[CommandId], completion_order: &Mutex<Vec<CommandId>>) {
        let mut results = Vec::new();
        for chunk in order.chunks(self.config.parallel_execution_limit.max(1)) {
            let mut handles = Vec::new();
            for command_id in chunk {
                let command = batch.commands.iter().find(|c| c.id == *command_id).unwrap().clone();
                let executor = Arc::clone(&self.executor);
                handles.push(tokio::spawn(async move { executor.execute(command).await }));
            }
            for handle in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(error = %e, "batch member task panicked"),
                }
            }
        }

        for result in results {
            let success = result.success;
            batch.command_results.insert(result.command_id, result.clone());
            if success {
                batch.completed_commands += 1;
                completion_order.lock().await.push(result.command_id);
            } else {
                batch.failed_commands += 1;
                batch.error_summary.push(result.error_message.clone().unwrap_or_default());
            }
            self.emit_batch_progress(batch).await;
        }
    }

    /// Batch-progress event emitted after each member completes or fails
    /// (spec §4.7): `{batchId,total,completed,failed,percent,elapsed_ms}`.
    async fn emit_batch_progress(&self, batch: &Batch) {
        let done = batch.completed_commands + batch.failed_commands;
        let percent = if batch.total_commands == 0 { 100.0 } else { (done as f64 / batch.total_commands as f64) * 100.0 };
        let elapsed_ms = batch.started_at.map(|s| (Utc::now() - s).num_milliseconds().max(0) as f64).unwrap_or(0.0);
        self.events
            .emit(
                cq_types::CommandEvent::for_batch(EventType::BatchEvent, batch.id)
                    .with_extra("stage", serde_json::json!("progress"))
                    .with_extra("total", serde_json::json!(batch.total_commands))
                    .with_extra("completed", serde_json::json!(batch.completed_commands))
                    .with_extra("failed", serde_json::json!(batch.failed_commands))
                    .with_extra("percent", serde_json::json!(percent))
                    .with_extra("elapsed_ms", serde_json::json!(elapsed_ms)),
            )
            .await;
    }

    /// Compensating actions run in reverse completion order — the plan is
    /// built already reversed, then walked forward, matching the source's
    /// one-time `reverse()` at generation time rather than at replay time.
    async fn rollback(&self, batch: &mut Batch, completion_order: &[CommandId]) {
        let compensators = self.compensators.lock().await;
        let mut plan = Vec::new();
        let mut attempted = Vec::new();
        for command_id in completion_order.iter().rev() {
            let Some(command) = batch.commands.iter().find(|c| c.id == *command_id) else { continue };
            let Some(compensator) = compensators.get(&command.type_name) else { continue };
            if !compensator.validate(command).await {
                continue;
            }
            match tokio::time::timeout(
                std::time::Duration::from_secs(self.config.rollback_timeout_seconds),
                compensator.execute(command),
            )
            .await
            {
                Ok(Some(inverse)) => {
                    attempted.push(compensator.action_type().to_string());
                    plan.push(inverse);
                }
                Ok(None) => warn!(command_id = %command_id, "compensating action produced no inverse command"),
                Err(_) => warn!(command_id = %command_id, "compensating action timed out during rollback"),
            }
        }
        batch.rollback_plan = Some(plan);
        batch.rollback_status = Some(format!("{} action(s) attempted", attempted.len()));
        info!(batch_id = %batch.id, actions = attempted.len(), "rollback complete");
    }
}

fn has_cycle(batch: &Batch) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut adjacency: HashMap<CommandId, Vec<CommandId>> = HashMap::new();
    for dep in &batch.dependencies {
        adjacency.entry(dep.from_command_id).or_default().push(dep.to_command_id);
    }
    let mut colors: HashMap<CommandId, Color> = batch.commands.iter().map(|c| (c.id, Color::White)).collect();

    fn visit(node: CommandId, adjacency: &HashMap<CommandId, Vec<CommandId>>, colors: &mut HashMap<CommandId, Color>) -> bool {
        colors.insert(node, Color::Gray);
        if let Some(neighbors) = adjacency.get(&node) {
            for &next in neighbors {
                match colors.get(&next).copied().unwrap_or(Color::White) {
                    Color::Gray => return true,
                    Color::White => {
                        if visit(next, adjacency, colors) {
                            return true;
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        false
    }

    for command in &batch.commands {
        if colors.get(&command.id).copied() == Some(Color::White) && visit(command.id, &adjacency, &mut colors) {
            return true;
        }
    }
    false
}

fn longest_dependency_chain(batch: &Batch) -> usize {
    let mut adjacency: HashMap<CommandId, Vec<CommandId>> = HashMap::new();
    for dep in &batch.dependencies {
        adjacency.entry(dep.from_command_id).or_default().push(dep.to_command_id);
    }

    fn depth(node: CommandId, adjacency: &HashMap<CommandId, Vec<CommandId>>, memo: &mut HashMap<CommandId, usize>) -> usize {
        if let Some(&cached) = memo.get(&node) {
            return cached;
        }
        let result = match adjacency.get(&node) {
            Some(neighbors) if !neighbors.is_empty() => {
                1 + neighbors.iter().map(|&n| depth(n, adjacency, memo)).max().unwrap_or(0)
            }
            _ => 0,
        };
        memo.insert(node, result);
        result
    }

    let mut memo = HashMap::new();
    batch.commands.iter().map(|c| depth(c.id, &adjacency, &mut memo)).max().unwrap_or(0)
}

/// Kahn's-algorithm layering: each layer holds every node whose
/// dependencies are already satisfied by prior layers, letting Mixed mode
/// run a layer in parallel and still honour ordering across layers.
fn topological_layers(batch: &Batch) -> Vec<Vec<CommandId>> {
    let mut in_degree: HashMap<CommandId, usize> = batch.commands.iter().map(|c| (c.id, 0)).collect();
    let mut adjacency: HashMap<CommandId, Vec<CommandId>> = HashMap::new();
    for dep in &batch.dependencies {
        adjacency.entry(dep.from_command_id).or_default().push(dep.to_command_id);
        *in_degree.entry(dep.to_command_id).or_insert(0) += 1;
    }

    let mut layers = Vec::new();
    let mut remaining = in_degree.clone();
    let mut frontier: VecDeque<CommandId> =
        remaining.iter().filter(|(_, &deg)| deg == 0).map(|(&id, _)| id).collect();

    while !frontier.is_empty() {
        let layer: Vec<CommandId> = frontier.drain(..).collect();
        for &node in &layer {
            remaining.remove(&node);
            if let Some(neighbors) = adjacency.get(&node) {
                for &next in neighbors {
                    if let Some(deg) = remaining.get_mut(&next) {
                        *deg -= 1;
                        if *deg == 0 {
                            frontier.push_back(next);
                        }
                    }
                }
            }
        }
        layers.push(layer);
    }

    // Any commands left unresolved (cycle slipped past validation) run in
    // one final layer rather than being silently dropped.
    if !remaining.is_empty() {
        layers.push(remaining.keys().copied().collect());
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_types::{CommandCategory, CommandStatus, ResultErrorKind};
    use std::sync::Mutex as StdMutex;

    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn execute(&self, command: Command) -> CommandResult {
            CommandResult::success(command.id, CommandStatus::Completed, None, 1)
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl CommandExecutor for FailingExecutor {
        async fn execute(&self, command: Command) -> CommandResult {
            CommandResult::failure(command.id, CommandStatus::Failed, ResultErrorKind::Exception, "boom")
        }
    }

    fn executor() -> BatchExecutor {
        BatchExecutor::new(
            BatchExecutionConfig::default(),
            Arc::new(EchoExecutor),
            Arc::new(crate::sink::NullEventSink),
        )
    }

    fn cmd() -> Command {
        Command::new("move_forward", CommandCategory::Movement, CommandPriority::Normal)
    }

    #[tokio::test]
    async fn sequential_batch_runs_all_members_to_completion() {
        let exec = executor();
        let commands = vec![cmd(), cmd(), cmd()];
        let batch = exec
            .create_batch(
                "drive",
                commands,
                Vec::new(),
                BatchExecutionMode::Sequential,
                BatchTransactionMode::BestEffort,
                CommandPriority::Normal,
                false,
            )
            .await
            .unwrap();

        let finished = exec.execute_batch(batch.id).await.unwrap();
        assert_eq!(finished.completed_commands, 3);
        assert_eq!(finished.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn cyclic_dependency_is_rejected_at_creation() {
        let exec = executor();
        let a = cmd();
        let b = cmd();
        let deps = vec![
            BatchDependency { from_command_id: a.id, to_command_id: b.id },
            BatchDependency { from_command_id: b.id, to_command_id: a.id },
        ];
        let err = exec
            .create_batch(
                "cycle",
                vec![a, b],
                deps,
                BatchExecutionMode::Mixed,
                BatchTransactionMode::BestEffort,
                CommandPriority::Normal,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::CyclicDeps { .. }));
    }

    #[tokio::test]
    async fn parallel_mode_rejects_dependencies() {
        let exec = executor();
        let a = cmd();
        let b = cmd();
        let deps = vec![BatchDependency { from_command_id: a.id, to_command_id: b.id }];
        let err = exec
            .create_batch(
                "parallel-with-deps",
                vec![a, b],
                deps,
                BatchExecutionMode::Parallel,
                BatchTransactionMode::BestEffort,
                CommandPriority::Normal,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ModeConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn all_or_nothing_without_compensators_triggers_rollback_with_empty_plan() {
        let exec = BatchExecutor::new(
            BatchExecutionConfig::default(),
            Arc::new(FailingExecutor),
            Arc::new(crate::sink::NullEventSink),
        );
        let batch = exec
            .create_batch(
                "risky",
                vec![cmd()],
                Vec::new(),
                BatchExecutionMode::Sequential,
                BatchTransactionMode::AllOrNothing,
                CommandPriority::Normal,
                false,
            )
            .await
            .unwrap();

        let finished = exec.execute_batch(batch.id).await.unwrap();
        assert_eq!(finished.status, BatchStatus::RolledBack);
        assert_eq!(finished.rollback_plan.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn batch_from_template_applies_per_member_overrides() {
        let exec = executor();
        let template = BatchTemplate {
            name: "drive-square".to_string(),
            specs: vec![
                CommandSpec {
                    type_name: "move_forward".to_string(),
                    category: CommandCategory::Movement,
                    priority: CommandPriority::Normal,
                    parameters: HashMap::from([("step".to_string(), serde_json::json!(1))]),
                },
                CommandSpec {
                    type_name: "move_forward".to_string(),
                    category: CommandCategory::Movement,
                    priority: CommandPriority::Normal,
                    parameters: HashMap::from([("step".to_string(), serde_json::json!(1))]),
                },
            ],
            dependencies: vec![(0, 1)],
            execution_mode: BatchExecutionMode::Mixed,
            transaction_mode: BatchTransactionMode::BestEffort,
        };
        exec.save_template(template).await;

        let mut overrides = HashMap::new();
        overrides.insert(1, HashMap::from([("step".to_string(), serde_json::json!(5))]));

        let batch = exec
            .create_batch_from_template("drive-square", CommandPriority::High, &overrides)
            .await
            .unwrap();

        assert_eq!(batch.total_commands, 2);
        assert_eq!(batch.dependencies.len(), 1);
        assert_eq!(batch.commands[1].parameters.get("step").unwrap(), &serde_json::json!(5));
        assert_eq!(batch.priority, CommandPriority::High);
    }

    #[tokio::test]
    async fn unknown_template_name_is_rejected() {
        let exec = executor();
        let err = exec
            .create_batch_from_template("does-not-exist", CommandPriority::Normal, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ModeConstraintViolation { .. }));
    }

    struct RecordingCallback {
        seen: Arc<StdMutex<Vec<BatchStatus>>>,
    }

    #[async_trait]
    impl BatchCompletionCallback for RecordingCallback {
        async fn on_complete(&self, batch: &Batch) {
            self.seen.lock().unwrap().push(batch.status);
        }
    }

    #[tokio::test]
    async fn completion_callback_runs_once_batch_reaches_a_terminal_state() {
        let exec = executor();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        exec.register_completion_callback(Arc::new(RecordingCallback { seen: Arc::clone(&seen) })).await;

        let batch = exec
            .create_batch(
                "drive",
                vec![cmd()],
                Vec::new(),
                BatchExecutionMode::Sequential,
                BatchTransactionMode::BestEffort,
                CommandPriority::Normal,
                false,
            )
            .await
            .unwrap();
        exec.execute_batch(batch.id).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![BatchStatus::Completed]);
    }
}
