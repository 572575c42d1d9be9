use serde::{Deserialize, Serialize};

/// Total order over command priority. Discriminants are preserved from the
/// source's `IntEnum` so wire/debug representations stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Emergency = 3,
}

impl CommandPriority {
    pub const ALL: [CommandPriority; 4] = [
        CommandPriority::Emergency,
        CommandPriority::High,
        CommandPriority::Normal,
        CommandPriority::Low,
    ];

    /// Priorities in dispatch order, highest first.
    pub fn dispatch_order() -> impl Iterator<Item = CommandPriority> {
        Self::ALL.into_iter()
    }
}

impl Default for CommandPriority {
    fn default() -> Self {
        CommandPriority::Normal
    }
}
