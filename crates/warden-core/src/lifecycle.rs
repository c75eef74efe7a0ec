//! Capsule lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a capsule instance.
///
/// `Created -> Booted -> Shutdown`. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Constructed but not yet booted (or a boot hook failed).
    #[default]
    Created,
    /// Accepting triggers.
    Booted,
    /// Permanently dead.
    Shutdown,
}

impl LifecycleState {
    /// Returns the lowercase name used in messages and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Booted => "booted",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse the lowercase wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "booted" => Some(Self::Booted),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            LifecycleState::Created,
            LifecycleState::Booted,
            LifecycleState::Shutdown,
        ] {
            assert_eq!(LifecycleState::parse(state.as_str()), Some(state));
        }
        assert_eq!(LifecycleState::parse("loading"), None);
    }
}
