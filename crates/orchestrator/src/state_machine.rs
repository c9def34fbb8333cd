use integrations_core::IntegrationState;

use crate::error::{OrchestratorError, Result};

pub struct IntegrationStateMachine;

impl IntegrationStateMachine {
    pub fn validate_transition(from: &IntegrationState, to: &IntegrationState) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &IntegrationState) -> Vec<IntegrationState> {
        match from {
            IntegrationState::Starting => {
                vec![IntegrationState::Initializing, IntegrationState::Failed]
            }
            IntegrationState::Initializing => {
                vec![IntegrationState::Ready, IntegrationState::Failed]
            }
            IntegrationState::Ready => vec![IntegrationState::Stopping, IntegrationState::Failed],
            IntegrationState::Stopping => {
                vec![IntegrationState::Terminated, IntegrationState::Failed]
            }
            IntegrationState::Terminated | IntegrationState::Failed => vec![],
        }
    }

    pub fn can_transition(from: &IntegrationState, to: &IntegrationState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Next state on the happy path.
    pub fn next_state(current: &IntegrationState) -> Option<IntegrationState> {
        match current {
            IntegrationState::Starting => Some(IntegrationState::Initializing),
            IntegrationState::Initializing => Some(IntegrationState::Ready),
            IntegrationState::Ready => Some(IntegrationState::Stopping),
            IntegrationState::Stopping => Some(IntegrationState::Terminated),
            IntegrationState::Terminated | IntegrationState::Failed => None,
        }
    }
}
