pub mod ack;
pub mod batch;
pub mod cancellation;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod sink;

pub use ack::{AckConfig, AckStatistics, AcknowledgmentTracker};
pub use batch::{
    BatchCompletionCallback, BatchExecutionConfig, BatchExecutor, BatchStatistics, BatchTemplate, CommandExecutor,
    CommandSpec,
};
pub use cancellation::{CancellationConfig, CancellationManager, CancellationStatistics, CleanupHandler, CommandDirectory};
pub use persistence::{HistoryEntry, InMemoryPersistence, MetricEntry, PersistenceConfig, PersistencePort};
pub use queue::{DequeueOutcome, PriorityQueue, QueueConfig, QueueStatistics};
pub use retry::backoff_delay_ms;
pub use sink::{AuditSink, ChannelEventSink, EventSink, NullAuditSink, NullEventSink};
