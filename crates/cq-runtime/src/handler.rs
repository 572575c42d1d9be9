use std::sync::Arc;

use async_trait::async_trait;
use cq_types::{Command, CommandResult, HandlerError};

/// A progress callback a handler may invoke while it runs; wired by the
/// Processor onto the Acknowledgment Tracker so progress reaches the event
/// sink without the handler knowing either exists.
pub type ProgressCallback = Arc<dyn Fn(f64, Option<String>) + Send + Sync>;

/// Executes one command type (spec §4.4). Implementations register with
/// the Processor via [`Processor::register_handler`](crate::processor::Processor::register_handler);
/// `can_handle` decides routing, `handle` does the work. The `on_*` hooks
/// default to no-ops so a handler can opt into only what it needs.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn can_handle(&self, command: &Command) -> bool;

    async fn handle(&self, command: &Command, progress: ProgressCallback) -> Result<CommandResult, HandlerError>;

    async fn on_before(&self, _command: &Command) {}

    async fn on_after(&self, _command: &Command, _result: &CommandResult) {}

    async fn on_error(&self, _command: &Command, _error: &HandlerError) {}
}
