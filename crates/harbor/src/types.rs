use serde::{Deserialize, Serialize};

/// Lifecycle state of a plugin instance
///
/// ```text
/// DISCOVERED → LOADING → ACTIVE → STOPPING → UNLOADED
///                 └──────────────────────────→ UNLOADED   (staged generation discarded)
///      any non-terminal state ─────────────→ FAILED
/// ```
///
/// UNLOADED and FAILED are terminal for an instance generation. Serving the
/// plugin again takes a fresh load, which produces a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LifecycleState {
    Discovered = 0,
    Loading = 1,
    Active = 2,
    Stopping = 3,
    Unloaded = 4,
    Failed = 5,
}

impl LifecycleState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Discovered,
            1 => Self::Loading,
            2 => Self::Active,
            3 => Self::Stopping,
            4 => Self::Unloaded,
            _ => Self::Failed,
        }
    }

    /// Check if the state is terminal for its generation
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Unloaded | LifecycleState::Failed)
    }

    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Discovered, Loading)
            | (Loading, Active)
            | (Loading, Unloaded)
            | (Active, Stopping)
            | (Stopping, Unloaded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Upper-case name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Discovered => "DISCOVERED",
            LifecycleState::Loading => "LOADING",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Unloaded => "UNLOADED",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Characters allowed in plugin ids, plugin names and capability names
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
