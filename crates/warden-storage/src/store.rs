//! The proposal store abstraction.
//!
//! Every status mutation goes through `update_if`, a compare-and-swap on the
//! current status, so concurrent approve/reject/execute calls on one
//! proposal are linearizable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use warden_core::error::WardenError;
use warden_core::types::{ActionResult, Proposal, ProposalStatus};

/// Partial update applied by `ProposalStore::update_if`.
///
/// Only mutable proposal fields are representable here. `approval_context`
/// is applied to `payload.approval_context` as a JSON merge patch
/// (RFC 7396) inside the store, so concurrent writers never drop each
/// other's keys. The rest of the payload is untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposalPatch {
    pub status: Option<ProposalStatus>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub approval_context: Option<serde_json::Value>,
}

impl ProposalPatch {
    pub fn status(status: ProposalStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// Filter for `ProposalStore::query_proposals`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalQuery {
    /// Empty means any status.
    pub statuses: Vec<ProposalStatus>,
    pub action_type: Option<String>,
    pub target_id: Option<String>,
    pub order: SortOrder,
    pub limit: usize,
}

impl ProposalQuery {
    pub fn new(statuses: Vec<ProposalStatus>, order: SortOrder, limit: usize) -> Self {
        Self {
            statuses,
            action_type: None,
            target_id: None,
            order,
            limit,
        }
    }

    pub fn matches(&self, proposal: &Proposal) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&proposal.status))
            && self
                .action_type
                .as_deref()
                .map_or(true, |t| t == proposal.action_type)
            && self
                .target_id
                .as_deref()
                .map_or(true, |t| t == proposal.target_id)
    }
}

/// Result of `ProposalStore::insert_proposal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The proposal (and its idempotency key, if any) was stored.
    Inserted,
    /// The idempotency key already maps to this stored action; nothing was
    /// written.
    Existing(Uuid),
}

/// Result of recording an approval vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The approver was added; carries the full approver list.
    Added(Vec<String>),
    /// The approver had already voted; nothing changed.
    AlreadyRecorded(Vec<String>),
    /// The proposal is missing or not in the expected status.
    StatusMismatch,
}

/// Durable keyed storage for proposals, results, and idempotency keys.
///
/// Implementations must give read-your-writes consistency and make every
/// method atomic.
pub trait ProposalStore: Send + Sync {
    /// Store a new proposal together with its idempotency key.
    ///
    /// When the key is already mapped, returns `Existing` with the stored
    /// action's id. The key never maps to an id whose proposal was not
    /// written.
    fn insert_proposal(&self, proposal: &Proposal) -> Result<InsertOutcome, WardenError>;

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, WardenError>;

    /// Apply `patch` only if the current status equals `expected`.
    ///
    /// Returns `false` when the proposal is missing or its status differs.
    fn update_if(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        patch: &ProposalPatch,
    ) -> Result<bool, WardenError>;

    /// Add `approver` to the proposal's approver set if its status equals
    /// `expected`.
    fn add_approver(
        &self,
        id: Uuid,
        expected: ProposalStatus,
        approver: &str,
    ) -> Result<VoteOutcome, WardenError>;

    fn query_proposals(&self, query: &ProposalQuery) -> Result<Vec<Proposal>, WardenError>;

    /// Store the result of an execution and move the proposal from
    /// `Executing` to `terminal` in one step.
    ///
    /// Returns `false` without writing anything when the proposal is not
    /// `Executing`. On error neither the result nor the status is written.
    fn record_result(
        &self,
        result: &ActionResult,
        terminal: ProposalStatus,
    ) -> Result<bool, WardenError>;

    fn get_result(&self, action_id: Uuid) -> Result<Option<ActionResult>, WardenError>;
}

/// Apply `patch` to `target` as a JSON merge patch (RFC 7396).
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(
                    target.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
    }
}
