//! Read-only views over the proposal store.

use std::sync::Arc;

use crate::error::GovernanceError;
use warden_core::types::{Proposal, ProposalStatus};
use warden_storage::{ProposalQuery, ProposalStore, SortOrder};

/// Statuses that close out a proposal's history.
const HISTORY_STATUSES: [ProposalStatus; 3] = [
    ProposalStatus::Success,
    ProposalStatus::Failed,
    ProposalStatus::Rejected,
];

pub struct ProposalQueries {
    store: Arc<dyn ProposalStore>,
}

impl ProposalQueries {
    pub fn new(store: Arc<dyn ProposalStore>) -> Self {
        Self { store }
    }

    /// Approval queue, oldest first. Defaults to `proposed`.
    pub fn list_pending(
        &self,
        status: Option<ProposalStatus>,
        action_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Proposal>, GovernanceError> {
        let mut query = ProposalQuery::new(
            vec![status.unwrap_or(ProposalStatus::Proposed)],
            SortOrder::Ascending,
            limit,
        );
        query.action_type = action_type.map(str::to_string);
        Ok(self.store.query_proposals(&query)?)
    }

    /// Finished proposals, newest first. `entity_id` filters on `target_id`.
    pub fn list_history(
        &self,
        entity_id: Option<&str>,
        action_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Proposal>, GovernanceError> {
        let mut query = ProposalQuery::new(HISTORY_STATUSES.to_vec(), SortOrder::Descending, limit);
        query.target_id = entity_id.map(str::to_string);
        query.action_type = action_type.map(str::to_string);
        Ok(self.store.query_proposals(&query)?)
    }
}
