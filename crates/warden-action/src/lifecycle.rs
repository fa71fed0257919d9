//! Proposal lifecycle: propose, approve, reject.
//!
//! Owns proposal creation and every transition out of `proposed`.
//! All status writes are compare-and-swap against the store, so concurrent
//! approvers and rejecters see exactly one winner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GovernanceError;
use crate::policy::PolicyEngine;
use crate::state_machine::validate_transition;
use warden_core::types::{ActionSource, Proposal, ProposalStatus, RiskLevel};
use warden_storage::{InsertOutcome, ProposalPatch, ProposalStore, VoteOutcome};

/// Input to `LifecycleManager::propose`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposeRequest {
    pub action_type: String,
    pub target_entity: String,
    pub target_id: String,
    #[serde(default)]
    pub payload: Value,
    pub risk_level: RiskLevel,
    pub source: ActionSource,
    pub confidence_score: f64,
    /// Producer-side demand for human review, on top of the policy.
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ProposeRequest {
    /// A manual, medium-risk request with full confidence and an empty payload.
    pub fn new(
        action_type: impl Into<String>,
        target_entity: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            target_entity: target_entity.into(),
            target_id: target_id.into(),
            payload: Value::Object(serde_json::Map::new()),
            risk_level: RiskLevel::Medium,
            source: ActionSource::Manual,
            confidence_score: 1.0,
            requires_approval: false,
            idempotency_key: None,
        }
    }

    /// Parse a request from front-end JSON. Unknown risk levels or sources
    /// and missing fields become validation errors.
    pub fn from_json(value: Value) -> Result<Self, GovernanceError> {
        serde_json::from_value(value).map_err(|e| GovernanceError::Validation(e.to_string()))
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_source(mut self, source: ActionSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_confidence(mut self, confidence_score: f64) -> Self {
        self.confidence_score = confidence_score;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn validate(&self) -> Result<(), GovernanceError> {
        if self.action_type.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "action_type must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(GovernanceError::Validation(format!(
                "confidence_score must be within [0, 1], got {}",
                self.confidence_score
            )));
        }
        if !matches!(self.payload, Value::Object(_) | Value::Null) {
            return Err(GovernanceError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }
        if self.idempotency_key.as_deref().is_some_and(str::is_empty) {
            return Err(GovernanceError::Validation(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Owns the transitions out of `proposed`.
pub struct LifecycleManager {
    store: Arc<dyn ProposalStore>,
    policy: PolicyEngine,
    system_approver: String,
    /// Last auto-approval per rule pattern, for rules with a cooldown.
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn ProposalStore>,
        policy: PolicyEngine,
        system_approver: impl Into<String>,
    ) -> Self {
        Self {
            store,
            policy,
            system_approver: system_approver.into(),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Create a proposal, evaluate policy, and auto-approve if allowed.
    ///
    /// A repeated idempotency key returns the original id without creating
    /// anything.
    pub fn propose(&self, request: ProposeRequest) -> Result<Uuid, GovernanceError> {
        request.validate()?;

        let id = Uuid::new_v4();
        let payload = match request.payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let mut proposal = Proposal {
            id,
            action_type: request.action_type,
            target_entity: request.target_entity,
            target_id: request.target_id,
            payload,
            risk_level: request.risk_level,
            source: request.source,
            confidence_score: request.confidence_score,
            requires_approval: request.requires_approval,
            requires_two_approvals: false,
            status: ProposalStatus::Proposed,
            approvers: Vec::new(),
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejection_reason: None,
            idempotency_key: request.idempotency_key,
            created_at: Utc::now(),
        };

        let decision = self.policy.evaluate(&proposal);
        proposal.requires_approval |= decision.requires_approval;
        proposal.requires_two_approvals = decision.requires_two_approvals;

        let mut auto_approve = decision.approved && !proposal.requires_approval;
        let mut stamp = None;
        if auto_approve {
            if let (Some(pattern), Some(seconds)) =
                (decision.policy_matched.as_deref(), decision.cooldown_seconds)
            {
                stamp = self.enter_cooldown(pattern, Duration::from_secs(seconds));
                if stamp.is_none() {
                    info!(
                        action_id = %id,
                        policy = %pattern,
                        cooldown_seconds = seconds,
                        "Policy in cooldown; manual approval required"
                    );
                    auto_approve = false;
                    proposal.requires_approval = true;
                }
            }
        }

        if auto_approve {
            proposal.status = ProposalStatus::Approved;
            proposal.approved_by = Some(self.system_approver.clone());
            proposal.approved_at = Some(Utc::now());
        }

        // The cooldown only counts once this proposal is actually stored.
        let outcome = self.store.insert_proposal(&proposal);
        if !matches!(outcome, Ok(InsertOutcome::Inserted)) {
            if let Some(stamp) = stamp {
                self.restore_cooldown(stamp);
            }
        }
        if let InsertOutcome::Existing(existing) = outcome? {
            info!(
                action_id = %existing,
                idempotency_key = ?proposal.idempotency_key,
                "Duplicate proposal; returning existing action"
            );
            return Ok(existing);
        }

        info!(
            action_id = %id,
            action_type = %proposal.action_type,
            risk_level = %proposal.risk_level,
            status = %proposal.status,
            reason = %decision.reason,
            "Proposal created"
        );
        Ok(id)
    }

    /// Record an approval vote.
    ///
    /// Returns `false` if the proposal is no longer `proposed`, the approver
    /// already voted, or a concurrent caller won the transition. Proposals
    /// flagged for two approvals stay `proposed` until two distinct
    /// approvers have voted.
    pub fn approve(
        &self,
        id: Uuid,
        approved_by: &str,
        additional_context: Option<Value>,
    ) -> Result<bool, GovernanceError> {
        if approved_by.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "approved_by must not be empty".to_string(),
            ));
        }
        let proposal = self.load(id)?;
        if let Err(e) = validate_transition(proposal.status, ProposalStatus::Approved) {
            warn!(action_id = %id, approver = %approved_by, error = %e, "Approve ignored");
            return Ok(false);
        }

        if proposal.approvers.iter().any(|a| a == approved_by) {
            info!(action_id = %id, approver = %approved_by, "Duplicate approval vote ignored");
            return Ok(false);
        }

        // Context lands before the vote counts, so it is in place before any
        // voter can move the proposal out of `proposed`. The store merges it
        // with what earlier voters left.
        if let Some(context) = additional_context {
            let patch = ProposalPatch {
                approval_context: Some(context),
                ..ProposalPatch::default()
            };
            if !self.store.update_if(id, ProposalStatus::Proposed, &patch)? {
                warn!(action_id = %id, approver = %approved_by, "Approve lost race");
                return Ok(false);
            }
        }

        let approvers = match self
            .store
            .add_approver(id, ProposalStatus::Proposed, approved_by)?
        {
            VoteOutcome::Added(approvers) => approvers,
            VoteOutcome::AlreadyRecorded(_) => {
                info!(action_id = %id, approver = %approved_by, "Duplicate approval vote ignored");
                return Ok(false);
            }
            VoteOutcome::StatusMismatch => {
                warn!(action_id = %id, approver = %approved_by, "Approve lost race");
                return Ok(false);
            }
        };

        let needed = if proposal.requires_two_approvals { 2 } else { 1 };
        if approvers.len() < needed {
            info!(
                action_id = %id,
                approver = %approved_by,
                votes = approvers.len(),
                needed,
                "Approval recorded; awaiting further approvers"
            );
            return Ok(true);
        }

        let patch = ProposalPatch {
            status: Some(ProposalStatus::Approved),
            approved_by: Some(approved_by.to_string()),
            approved_at: Some(Utc::now()),
            ..ProposalPatch::default()
        };
        let applied = self.store.update_if(id, ProposalStatus::Proposed, &patch)?;
        if applied {
            info!(action_id = %id, approver = %approved_by, "Proposal approved");
        } else {
            warn!(action_id = %id, approver = %approved_by, "Approve lost race");
        }
        Ok(applied)
    }

    /// Reject a pending proposal. Returns `false` if it is no longer
    /// `proposed`.
    pub fn reject(
        &self,
        id: Uuid,
        rejected_by: &str,
        reason: &str,
    ) -> Result<bool, GovernanceError> {
        if rejected_by.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "rejected_by must not be empty".to_string(),
            ));
        }
        let proposal = self.load(id)?;
        if let Err(e) = validate_transition(proposal.status, ProposalStatus::Rejected) {
            warn!(action_id = %id, rejected_by = %rejected_by, error = %e, "Reject ignored");
            return Ok(false);
        }

        let patch = ProposalPatch {
            status: Some(ProposalStatus::Rejected),
            rejected_by: Some(rejected_by.to_string()),
            rejection_reason: Some(reason.to_string()),
            ..ProposalPatch::default()
        };
        let applied = self.store.update_if(id, ProposalStatus::Proposed, &patch)?;
        if applied {
            info!(action_id = %id, rejected_by = %rejected_by, reason = %reason, "Proposal rejected");
        } else {
            warn!(action_id = %id, rejected_by = %rejected_by, "Reject lost race");
        }
        Ok(applied)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Proposal>, GovernanceError> {
        Ok(self.store.get_proposal(id)?)
    }

    fn load(&self, id: Uuid) -> Result<Proposal, GovernanceError> {
        self.store
            .get_proposal(id)?
            .ok_or(GovernanceError::NotFound(id))
    }

    /// Start a cooldown for `pattern` unless one is running. Returns `None`
    /// while cooling down.
    fn enter_cooldown(&self, pattern: &str, cooldown: Duration) -> Option<CooldownStamp> {
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let previous = cooldowns.get(pattern).copied();
        if previous.is_some_and(|last| now.saturating_duration_since(last) < cooldown) {
            return None;
        }
        cooldowns.insert(pattern.to_string(), now);
        Some(CooldownStamp {
            pattern: pattern.to_string(),
            stamped: now,
            previous,
        })
    }

    /// Undo `enter_cooldown` for a proposal that was never stored.
    fn restore_cooldown(&self, stamp: CooldownStamp) {
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cooldowns.get(&stamp.pattern) != Some(&stamp.stamped) {
            return;
        }
        match stamp.previous {
            Some(previous) => cooldowns.insert(stamp.pattern, previous),
            None => cooldowns.remove(&stamp.pattern),
        };
    }
}

struct CooldownStamp {
    pattern: String,
    stamped: Instant,
    previous: Option<Instant>,
}
