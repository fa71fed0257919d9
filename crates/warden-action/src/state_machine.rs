//! Proposal state machine with validated transitions.
//!
//! proposed -> approved -> executing -> success | failed
//! proposed -> rejected

use crate::error::GovernanceError;
use warden_core::types::ProposalStatus;

/// Validate that a status transition is allowed.
pub fn validate_transition(from: ProposalStatus, to: ProposalStatus) -> Result<(), GovernanceError> {
    let valid = matches!(
        (from, to),
        (ProposalStatus::Proposed, ProposalStatus::Approved)
            | (ProposalStatus::Proposed, ProposalStatus::Rejected)
            | (ProposalStatus::Approved, ProposalStatus::Executing)
            | (ProposalStatus::Executing, ProposalStatus::Success)
            | (ProposalStatus::Executing, ProposalStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(GovernanceError::InvalidTransition(from, to))
    }
}
