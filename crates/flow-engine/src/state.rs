//! Engine-wide run state machine

use serde::{Deserialize, Serialize};

/// State of the run controller
///
/// `Stopped → Initializing → Ready → Running ⇄ Paused → Stopping → Stopped`,
/// with `Error` reachable from any non-Stopped state and left only via reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Stopped,
    Initializing,
    Ready,
    Running,
    Paused,
    Stopping,
    Error,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

impl EngineState {
    /// Whether the normal state machine allows moving to `next`
    ///
    /// Emergency stop bypasses this check.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Stopped | Ready, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Stopping) => true,
            (Stopping, Stopped) => true,
            (Error, Stopped) => true,
            (Error, Error) | (Stopped, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// A run context exists and control paths may be in flight
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// No run is in progress
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineState::*;

    #[test]
    fn test_normal_lifecycle() {
        let path = [Stopped, Initializing, Ready, Running, Paused, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_reachability() {
        for state in [Initializing, Ready, Running, Paused, Stopping] {
            assert!(state.can_transition_to(Error));
        }
        assert!(!Stopped.can_transition_to(Error));
        assert!(Error.can_transition_to(Stopped));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Initializing));
    }
}
