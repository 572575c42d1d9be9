pub mod ack;
pub mod batch;
pub mod category;
pub mod command;
pub mod error;
pub mod event;
pub mod ids;
pub mod priority;
pub mod status;
pub mod cancellation;

pub use ack::{AckStatus, Acknowledgment};
pub use batch::{Batch, BatchDependency, BatchExecutionMode, BatchStatus, BatchTransactionMode};
pub use cancellation::{CancellationReason, CancellationRequest, CancellationState};
pub use category::CommandCategory;
pub use command::{Command, CommandMetadata, CommandResult, ResultErrorKind};
pub use error::{AdmissionError, BatchError, CancellationError, HandlerError, PersistenceError, ValidationError};
pub use event::{AuditAction, CommandEvent, EventType};
pub use ids::{BatchId, CommandId, TrackingId};
pub use priority::CommandPriority;
pub use status::CommandStatus;
