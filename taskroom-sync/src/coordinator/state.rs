//! Coordinator lifecycle state machine.

use std::fmt;

use taskroom_core::SessionId;

/// Lifecycle of the sync coordinator.
///
/// ```text
/// Idle -> Initializing -> Subscribed <-> Syncing
///              |               |            |
///              +---------------+------------+--> TornDown -> Initializing
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    /// Cached state shown, waiting for the first remote snapshot.
    Initializing { session_id: SessionId },
    /// Live subscription delivering snapshots.
    Subscribed { session_id: SessionId },
    /// Replaying the pending queue.
    Syncing { session_id: SessionId },
    TornDown,
}

impl CoordinatorState {
    /// The active session, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            CoordinatorState::Initializing { session_id }
            | CoordinatorState::Subscribed { session_id }
            | CoordinatorState::Syncing { session_id } => Some(session_id),
            CoordinatorState::Idle | CoordinatorState::TornDown => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Initializing { .. } => "initializing",
            CoordinatorState::Subscribed { .. } => "subscribed",
            CoordinatorState::Syncing { .. } => "syncing",
            CoordinatorState::TornDown => "torn_down",
        }
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &CoordinatorState) -> bool {
        use CoordinatorState::*;
        match (self, next) {
            (Idle | TornDown, Initializing { .. }) => true,
            (Initializing { session_id: a }, Subscribed { session_id: b }) => a == b,
            (Subscribed { session_id: a }, Syncing { session_id: b }) => a == b,
            (Syncing { session_id: a }, Subscribed { session_id: b }) => a == b,
            (Initializing { .. } | Subscribed { .. } | Syncing { .. }, TornDown) => true,
            (Idle, _)
            | (Initializing { .. }, _)
            | (Subscribed { .. }, _)
            | (Syncing { .. }, _)
            | (TornDown, _) => false,
        }
    }

    /// Move to `next` if legal. Illegal transitions are logged and ignored.
    pub(crate) fn advance(&mut self, next: CoordinatorState) -> bool {
        if !self.can_transition_to(&next) {
            tracing::error!(
                from = self.name(),
                to = next.name(),
                "Rejected illegal coordinator transition"
            );
            return false;
        }
        tracing::debug!(from = self.name(), to = next.name(), "Coordinator transition");
        *self = next;
        true
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session_id() {
            Some(id) => write!(f, "{}({})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(id: &str) -> CoordinatorState {
        CoordinatorState::Initializing { session_id: SessionId::new(id) }
    }

    fn subscribed(id: &str) -> CoordinatorState {
        CoordinatorState::Subscribed { session_id: SessionId::new(id) }
    }

    fn syncing(id: &str) -> CoordinatorState {
        CoordinatorState::Syncing { session_id: SessionId::new(id) }
    }

    #[test]
    fn test_full_lifecycle_is_legal() {
        let mut state = CoordinatorState::Idle;
        assert!(state.advance(init("s1")));
        assert!(state.advance(subscribed("s1")));
        assert!(state.advance(syncing("s1")));
        assert!(state.advance(subscribed("s1")));
        assert!(state.advance(CoordinatorState::TornDown));
        assert!(state.advance(init("s2")));
        assert_eq!(state.session_id(), Some(&SessionId::new("s2")));
    }

    #[test]
    fn test_torn_down_cannot_resume_directly() {
        let mut state = CoordinatorState::TornDown;
        assert!(!state.advance(subscribed("s1")));
        assert_eq!(state, CoordinatorState::TornDown);
    }

    #[test]
    fn test_session_cannot_change_mid_lifecycle() {
        let state = init("s1");
        assert!(!state.can_transition_to(&subscribed("s2")));
        assert!(!state.can_transition_to(&init("s2")));
    }

    #[test]
    fn test_idle_cannot_tear_down() {
        assert!(!CoordinatorState::Idle.can_transition_to(&CoordinatorState::TornDown));
        assert!(!CoordinatorState::Idle.is_active());
    }

    #[test]
    fn test_display_includes_session() {
        assert_eq!(syncing("s9").to_string(), "syncing(s9)");
        assert_eq!(CoordinatorState::Idle.to_string(), "idle");
    }
}
