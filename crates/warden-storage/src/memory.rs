//! In-memory proposal store.
//!
//! A single mutex guards all state, which makes every operation atomic.
//! Suitable for tests and single-instance embedding only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use warden_core::error::WardenError;
use warden_core::types::{ActionResult, Proposal, ProposalStatus};

use crate::store::{
    merge_patch, InsertOutcome, ProposalPatch, ProposalQuery, ProposalStore, SortOrder,
    VoteOutcome,
};

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as the tie-breaker for equal `created_at`.
    proposals: Vec<Proposal>,
    index: HashMap<Uuid, usize>,
    results: HashMap<Uuid, ActionResult>,
    idempotency: HashMap<String, Uuid>,
}

impl Inner {
    fn proposal_mut(&mut self, id: Uuid) -> Option<&mut Proposal> {
        let pos = *self.index.get(&id)?;
        self.proposals.get_mut(pos)
    }
}

#[derive(Default)]
pub struct MemoryProposalStore {
    inner: Mutex<Inner>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, WardenError> {
        self.inner
            .lock()
            .map_err(|e| WardenError::Storage(format!("Lock poisoned: {}", e)))
    }
}

impl ProposalStore for MemoryProposalStore {
    fn insert_proposal(&self, proposal: &Proposal) -> Result<InsertOutcome, WardenError> {
        let mut inner = self.lock()?;
        if let Some(key) = &proposal.idempotency_key {
            if let Some(existing) = inner.idempotency.get(key) {
                return Ok(InsertOutcome::Existing(*existing));
            }
        }
        if inner.index.contains_key(&proposal.id) {
            return Err(WardenError::Storage(format!(
                "Proposal already exists: {}",
                proposal.id
            )));
        }
        let pos = inner.proposals.len();
        inner.proposals.push(proposal.clone());
        inner.index.insert(proposal.id, pos);
        if let Some(key) = &proposal.idempotency_key {
            inner.idempotency.insert(key.clone(), proposal.id);
        }
        Ok(InsertOutcome::Inserted)
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, WardenError> {
        let inner = self.lock()?;
        Ok(inner
            .index
            .get(&id)
            .and_then(|pos| inner.proposals.get(*pos))
            .cloned())
    }

    fn update_if(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<bool, WardenError> {
        let mut inner = self.lock()?;
        let Some(proposal) = inner.proposal_mut(id) else {
            return Ok(false);
        };
        if proposal.status != expected {
            return Ok(false);
        }

        if let Some(status) = patch.status {
            proposal.status = status;
        }
        if let Some(by) = &patch.approved_by {
            proposal.approved_by = Some(by.clone());
        }
        if let Some(at) = patch.approved_at {
            proposal.approved_at = Some(at);
        }
        if let Some(by) = &patch.rejected_by {
            proposal.rejected_by = Some(by.clone());
        }
        if let Some(reason) = &patch.rejection_reason {
            proposal.rejection_reason = Some(reason.clone());
        }
        if let Some(context) = &patch.approval_context {
            if let Some(obj) = proposal.payload.as_object_mut() {
                let current = obj
                    .entry("approval_context")
                    .or_insert(serde_json::Value::Null);
                merge_patch(current, context);
            }
        }
        Ok(true)
    }

    fn add_approver(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        approver: &str,
    ) -> Result<VoteOutcome, WardenError> {
        let mut inner = self.lock()?;
        let Some(proposal) = inner.proposal_mut(id) else {
            return Ok(VoteOutcome::StatusMismatch);
        };
        if proposal.status != expected {
            return Ok(VoteOutcome::StatusMismatch);
        }
        if proposal.approvers.iter().any(|a| a == approver) {
            return Ok(VoteOutcome::AlreadyRecorded(proposal.approvers.clone()));
        }
        proposal.approvers.push(approver.to_string());
        Ok(VoteOutcome::Added(proposal.approvers.clone()))
    }

    fn query_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, WardenError> {
        let inner = self.lock()?;
        let mut result: Vec<Proposal> = inner
            .proposals
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();

        // Stable sorts keep insertion order among equal timestamps.
        match query.order {
            SortOrder::Ascending => result.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortOrder::Descending => {
                result.reverse();
                result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
        }
        result.truncate(query.limit);
        Ok(result)
    }

    fn record_result(
        &self,
        result: &ActionResult,
        terminal: ProposalStatus,
    ) -> Result<bool, WardenError> {
        let mut inner = self.lock()?;
        let executing = inner
            .proposal_mut(result.action_id)
            .is_some_and(|p| p.status == ProposalStatus::Executing);
        if !executing {
            return Ok(false);
        }
        if inner.results.contains_key(&result.action_id) {
            return Err(WardenError::Storage(format!(
                "Result already recorded for action: {}",
                result.action_id
            )));
        }
        inner.results.insert(result.action_id, result.clone());
        if let Some(proposal) = inner.proposal_mut(result.action_id) {
            proposal.status = terminal;
        }
        Ok(true)
    }

    fn get_result(&self, action_id: Uuid) -> Result<Option<ActionResult>, WardenError> {
        Ok(self.lock()?.results.get(&action_id).cloned())
    }
}
