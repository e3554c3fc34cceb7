//! EMM State Machine
//!
//! Mobility FSM states driven by the detach procedure. Only the registration
//! slice of the EMM state machine is modelled here; attach, TAU and service
//! request handling live outside this crate.

use std::fmt;

use crate::context::UeId;

/// EMM State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmmState {
    /// Registered state
    Registered,
    /// De-registered initiated state (network initiated detach in progress)
    DeregisteredInitiated,
    /// De-registered state
    #[default]
    Deregistered,
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Registered => write!(f, "REGISTERED"),
            EmmState::DeregisteredInitiated => write!(f, "DEREGISTERED_INITIATED"),
            EmmState::Deregistered => write!(f, "DEREGISTERED"),
        }
    }
}

/// Per-UE EMM state machine
#[derive(Debug, Clone)]
pub struct EmmFsm {
    /// Current state
    state: EmmState,
    /// UE identifier
    ue_id: UeId,
}

impl EmmFsm {
    /// Create a new EMM FSM in the de-registered state
    pub fn new(ue_id: UeId) -> Self {
        Self {
            state: EmmState::Deregistered,
            ue_id,
        }
    }

    /// Get current state
    pub fn state(&self) -> EmmState {
        self.state
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: EmmState) {
        log::debug!("EMM FSM [{}]: {} -> {}", self.ue_id, self.state, new_state);
        self.state = new_state;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emm_fsm_starts_deregistered() {
        let fsm = EmmFsm::new(1);
        assert_eq!(fsm.state(), EmmState::Deregistered);
    }

    #[test]
    fn test_emm_fsm_transition() {
        let mut fsm = EmmFsm::new(1);
        fsm.transition(EmmState::Registered);
        assert_eq!(fsm.state(), EmmState::Registered);
        fsm.transition(EmmState::DeregisteredInitiated);
        assert_eq!(fsm.state(), EmmState::DeregisteredInitiated);
        fsm.transition(EmmState::Deregistered);
        assert_eq!(fsm.state(), EmmState::Deregistered);
    }

    #[test]
    fn test_emm_state_display() {
        assert_eq!(EmmState::Registered.to_string(), "REGISTERED");
        assert_eq!(
            EmmState::DeregisteredInitiated.to_string(),
            "DEREGISTERED_INITIATED"
        );
        assert_eq!(EmmState::Deregistered.to_string(), "DEREGISTERED");
    }
}
