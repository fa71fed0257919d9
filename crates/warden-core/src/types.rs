//! Core types and value objects for the governance pipeline.
//!
//! Defines proposals, their lifecycle status, policy rules and decisions,
//! and the execution result that closes an action's lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Ordinal risk classification. Variant order defines the total order
/// `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(format!("Unknown risk level: {}", s)),
        }
    }
}

/// Where a proposal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Signal,
    Proposal,
    Manual,
    Scheduled,
}

impl fmt::Display for ActionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionSource::Signal => write!(f, "signal"),
            ActionSource::Proposal => write!(f, "proposal"),
            ActionSource::Manual => write!(f, "manual"),
            ActionSource::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl std::str::FromStr for ActionSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(ActionSource::Signal),
            "proposal" => Ok(ActionSource::Proposal),
            "manual" => Ok(ActionSource::Manual),
            "scheduled" => Ok(ActionSource::Scheduled),
            _ => Err(format!("Unknown action source: {}", s)),
        }
    }
}

/// Proposal lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Approved,
    Executing,
    Success,
    Failed,
    Rejected,
}

impl ProposalStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Success | ProposalStatus::Failed | ProposalStatus::Rejected
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Proposed => write!(f, "proposed"),
            ProposalStatus::Approved => write!(f, "approved"),
            ProposalStatus::Executing => write!(f, "executing"),
            ProposalStatus::Success => write!(f, "success"),
            ProposalStatus::Failed => write!(f, "failed"),
            ProposalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(ProposalStatus::Proposed),
            "approved" => Ok(ProposalStatus::Approved),
            "executing" => Ok(ProposalStatus::Executing),
            "success" => Ok(ProposalStatus::Success),
            "failed" => Ok(ProposalStatus::Failed),
            "rejected" => Ok(ProposalStatus::Rejected),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

// =============================================================================
// Domain Structs
// =============================================================================

/// A governed request to perform a side-effecting action.
///
/// `id`, `action_type`, `target_entity`, `target_id`, `risk_level` and
/// `source` never change after creation. Only the status, approval and
/// rejection metadata, and `payload.approval_context` are mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub action_type: String,
    pub target_entity: String,
    pub target_id: String,
    pub payload: serde_json::Value,
    pub risk_level: RiskLevel,
    pub source: ActionSource,
    pub confidence_score: f64,
    pub requires_approval: bool,
    pub requires_two_approvals: bool,
    pub status: ProposalStatus,
    /// Distinct identities that have voted to approve.
    pub approvers: Vec<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An ordered policy unit.
///
/// `action_type_pattern` is either an exact action type or a prefix ending
/// in `*`. The rule only applies to proposals at or below `risk_threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub action_type_pattern: String,
    pub risk_threshold: RiskLevel,
    pub auto_approve: bool,
    #[serde(default)]
    pub require_two_approvals: bool,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

impl ApprovalRule {
    pub fn new(pattern: impl Into<String>, risk_threshold: RiskLevel, auto_approve: bool) -> Self {
        Self {
            action_type_pattern: pattern.into(),
            risk_threshold,
            auto_approve,
            require_two_approvals: false,
            cooldown_seconds: None,
        }
    }

    pub fn with_two_approvals(mut self) -> Self {
        self.require_two_approvals = true;
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = Some(seconds);
        self
    }
}

/// Output of policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub requires_approval: bool,
    pub requires_two_approvals: bool,
    pub reason: String,
    /// Pattern of the rule that matched, if any.
    pub policy_matched: Option<String>,
    pub cooldown_seconds: Option<u64>,
}

/// Outcome of executing an approved proposal. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: Uuid,
    pub success: bool,
    pub result_data: serde_json::Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub side_effects: Vec<serde_json::Value>,
    pub executed_at: DateTime<Utc>,
}

impl ActionResult {
    /// A failed result carrying `error` verbatim.
    pub fn failure(action_id: Uuid, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            action_id,
            success: false,
            result_data: serde_json::Value::Null,
            error: Some(error.into()),
            execution_time_ms,
            side_effects: Vec::new(),
            executed_at: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
