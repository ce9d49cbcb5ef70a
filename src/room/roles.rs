#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Role tag attached to a connection by its join event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Unassigned,
    Guest,
    /// Broadcast operator compositing the live program
    Obs,
    Admin,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Unassigned => "unassigned",
            Role::Guest => "guest",
            Role::Obs => "obs",
            Role::Admin => "admin",
        }
    }

    /// Whether this role receives program change fan-out
    pub fn follows_program(&self) -> bool {
        matches!(self, Role::Obs)
    }

    pub fn can_switch_program(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn can_read_diagnostics(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
