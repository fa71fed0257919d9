//! Error types for the governance pipeline.

use std::time::Duration;

use uuid::Uuid;
use warden_core::error::WardenError;
use warden_core::types::ProposalStatus;

/// Errors surfaced by propose/approve/reject/execute and the query surface.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Proposal not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(ProposalStatus, ProposalStatus),
    #[error("Rate limit exceeded for {action_type}: {max_per_minute} per minute")]
    RateLimited {
        action_type: String,
        max_per_minute: u32,
    },
    #[error("No handler registered for action type: {0}")]
    NoHandler(String),
    #[error("Before-execute hook failed: {0}")]
    HookFailed(String),
    #[error("Storage error: {0}")]
    Storage(#[from] WardenError),
}

impl GovernanceError {
    /// Transient failures that leave the proposal `approved` for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GovernanceError::RateLimited { .. })
    }
}

/// Errors returned by action handlers. The router turns these into failed
/// results; they never reach the caller of `execute`.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action handler failed: {0}")]
    HandlerFailed(String),
    #[error("Payload validation failed: {0}")]
    InvalidPayload(String),
    #[error("Action execution timed out after {0:?}")]
    Timeout(Duration),
}

impl ActionError {
    /// The message recorded on the failed result. Handler messages are kept
    /// verbatim.
    pub fn into_message(self) -> String {
        match self {
            ActionError::HandlerFailed(msg) => msg,
            other => other.to_string(),
        }
    }
}
