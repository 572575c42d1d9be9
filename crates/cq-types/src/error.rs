use thiserror::Error;

use crate::ids::{BatchId, CommandId};
use crate::status::CommandStatus;

/// Raised by the Priority Queue's `enqueue`; reported to the caller with
/// no side effects (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("queue is at global capacity ({capacity})")]
    QueueFull { capacity: usize },
    #[error("priority level is at capacity ({capacity})")]
    PerPriorityFull { capacity: usize },
    #[error("queue is shutting down and admits no new work")]
    Shutdown,
    #[error("global retry throttle exceeded ({max_per_window} per {window_seconds}s)")]
    GlobalRetryLimitExceeded { max_per_window: u32, window_seconds: u64 },
}

/// Rejected before any state change (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown command type: {type_name}")]
    UnknownCommandType { type_name: String },
    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },
    #[error("illegal status transition from {from} to {to}")]
    BadStatusTransition { from: CommandStatus, to: CommandStatus },
}

/// Routed through retry; terminal failure only after the retry budget is
/// exhausted (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler did not complete within the deadline")]
    Deadline,
    #[error("precondition failed: {reason}")]
    Precondition { reason: String },
    #[error("handler raised an exception: {message}")]
    Exception { message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CancellationError {
    #[error("command {command_id} not found")]
    NotFound { command_id: CommandId },
    #[error("command {command_id} is not cancellable in its current state")]
    NotCancellable { command_id: CommandId },
    #[error("command {command_id} is safety-critical and requires force=true")]
    SafetyCritical { command_id: CommandId },
    #[error("cleanup failed for command {command_id}: {reason}")]
    CleanupFailed { command_id: CommandId, reason: String },
    #[error("cancellation of {command_id} exceeded its overall timeout")]
    Timeout { command_id: CommandId },
    #[error("a cancellation for {command_id} is already in progress")]
    AlreadyInProgress { command_id: CommandId },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch size {size} exceeds maximum {max}")]
    SizeExceeded { size: usize, max: usize },
    #[error("cyclic dependency detected in batch {batch_id}")]
    CyclicDeps { batch_id: BatchId },
    #[error("dependency depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error("dependency references unknown command {command_id}")]
    UnknownReference { command_id: CommandId },
    #[error("execution/transaction mode constraint violated: {reason}")]
    ModeConstraintViolation { reason: String },
    #[error("member command {command_id} failed: {reason}")]
    MemberFailure { command_id: CommandId, reason: String },
    #[error("batch {batch_id} not found")]
    NotFound { batch_id: BatchId },
    #[error("batch {batch_id} is not in a pending state")]
    NotPending { batch_id: BatchId },
}

/// Persistence errors are retried with backoff by the caller; exhaustion
/// escalates to a degraded health state (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("backend I/O error: {message}")]
    Io { message: String },
    #[error("command {command_id} not found")]
    NotFound { command_id: CommandId },
}
