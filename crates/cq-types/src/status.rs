use serde::{Deserialize, Serialize};

/// A command's position in the lifecycle graph of spec §4.5. Terminal
/// states admit no further transitions; every mutator in this workspace
/// consults [`CommandStatus::can_transition_to`] before writing a new
/// status so the graph has exactly one source of truth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Timeout,
    Cancelling,
    RollingBack,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Cancelled
                | CommandStatus::Timeout
        )
    }

    /// Whether a transition from `self` to `next` is permitted by the graph
    /// in spec §4.5. Terminal states never transition further.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Executing)
                | (Queued, Timeout)
                | (Queued, Cancelled)
                | (Queued, Retrying)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Timeout)
                | (Executing, Cancelling)
                | (Executing, Retrying)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
                | (Retrying, Failed)
                | (Cancelling, Completed)
                | (Cancelling, RollingBack)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
                | (RollingBack, Cancelled)
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Queued => "queued",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Retrying => "retrying",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Cancelling => "cancelling",
            CommandStatus::RollingBack => "rolling_back",
        };
        f.write_str(s)
    }
}
