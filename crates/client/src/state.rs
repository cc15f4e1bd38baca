//! Controller state machine.

/// `{getting_codecs, running, switching, restarting, failed, closed}` per
/// spec; transitions are driven by [`crate::controller::AdaptiveController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    GettingCodecs,
    Running,
    Switching,
    Restarting,
    Failed,
    Closed,
}

impl ControllerState {
    /// Whether an explicit close is legal from this state. Every state can
    /// transition to `Closed`.
    pub fn can_close(&self) -> bool {
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Closed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        assert!(ControllerState::Closed.is_terminal());
        assert!(!ControllerState::Running.is_terminal());
    }

    #[test]
    fn every_state_can_close() {
        for state in [
            ControllerState::GettingCodecs,
            ControllerState::Running,
            ControllerState::Switching,
            ControllerState::Restarting,
            ControllerState::Failed,
            ControllerState::Closed,
        ] {
            assert!(state.can_close());
        }
    }
}
