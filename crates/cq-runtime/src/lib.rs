pub mod handler;
pub mod processor;

pub use handler::{CommandHandler, ProgressCallback};
pub use processor::{Processor, ProcessorConfig, ProcessorHealth, ProcessorStatus};
