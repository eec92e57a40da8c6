use install_core::PhaseState;

use crate::error::{OrchestratorError, Result};

pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: PhaseState, to: PhaseState) -> Result<()> {
        if Self::allowed_transitions(from).contains(&to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition { from, to })
        }
    }

    /// Completed may move to RolledBack only while the engine unwinds a
    /// failed plan.
    fn allowed_transitions(from: PhaseState) -> &'static [PhaseState] {
        match from {
            PhaseState::Unstarted => &[PhaseState::Running],
            PhaseState::Running => &[PhaseState::Completed, PhaseState::Failed],
            PhaseState::Completed => &[PhaseState::RolledBack],
            PhaseState::Failed => &[PhaseState::RolledBack],
            PhaseState::RolledBack => &[],
        }
    }

    pub fn can_transition(from: PhaseState, to: PhaseState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    pub fn is_terminal(state: PhaseState) -> bool {
        Self::allowed_transitions(state).is_empty()
    }
}
