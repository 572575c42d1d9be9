use async_trait::async_trait;
use cq_types::{AuditAction, CommandEvent};
use tokio::sync::mpsc;

/// Consumes lifecycle events (spec §6). No transport is implemented here;
/// this is an external collaborator boundary.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: CommandEvent);
}

/// Records security-relevant actions (spec §6).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, action: AuditAction);
}

pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: CommandEvent) {}
}

pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn log_action(&self, _action: AuditAction) {}
}

/// Forwards events onto an unbounded channel so tests can assert on
/// emission order without standing up a transport.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<CommandEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommandEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: CommandEvent) {
        let _ = self.sender.send(event);
    }
}
