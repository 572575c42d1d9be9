use serde::{Deserialize, Serialize};

/// Closed enum of command categories plus an open extension variant, per
/// the tagged-variant guidance for dispatching what the source keyed off a
/// dynamically-typed registry. Concrete command identities (MoveForward,
/// EmergencyStop, ...) are not modeled here; they live in `Command::type_name`
/// as caller-chosen labels, since the non-cancellable set and the
/// compensating-action registry both key off a type name rather than this
/// coarser category.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    Movement,
    SensorRead,
    Calibration,
    Diagnostic,
    System,
    Custom(String),
}

impl CommandCategory {
    pub fn name(&self) -> &str {
        match self {
            CommandCategory::Movement => "movement",
            CommandCategory::SensorRead => "sensor_read",
            CommandCategory::Calibration => "calibration",
            CommandCategory::Diagnostic => "diagnostic",
            CommandCategory::System => "system",
            CommandCategory::Custom(name) => name,
        }
    }
}
