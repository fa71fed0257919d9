//! Risk-based approval policy.
//!
//! Rules are scanned in order and the first rule whose pattern matches the
//! action type and whose threshold admits the proposal's risk level decides.
//! A low confidence score overrides any auto-approval.

use tracing::debug;

use warden_core::config::PolicyConfig;
use warden_core::types::{ApprovalDecision, ApprovalRule, Proposal, RiskLevel};

/// Trailing wildcard marker in rule patterns.
const WILDCARD: char = '*';

/// Returns true if `pattern` names `action_type` exactly, or is a prefix
/// ending in `*` that `action_type` starts with.
pub fn pattern_matches(pattern: &str, action_type: &str) -> bool {
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => action_type.starts_with(prefix),
        None => pattern == action_type,
    }
}

/// Pure evaluator over an ordered rule list.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<ApprovalRule>,
    confidence_floor: f64,
}

impl PolicyEngine {
    pub fn new(rules: Vec<ApprovalRule>, confidence_floor: f64) -> Self {
        Self {
            rules,
            confidence_floor,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.rules.clone(), config.confidence_floor)
    }

    pub fn rules(&self) -> &[ApprovalRule] {
        &self.rules
    }

    /// First rule matching both the action type and the risk threshold.
    pub fn find_rule(&self, action_type: &str, risk_level: RiskLevel) -> Option<&ApprovalRule> {
        self.rules.iter().find(|rule| {
            pattern_matches(&rule.action_type_pattern, action_type)
                && risk_level <= rule.risk_threshold
        })
    }

    pub fn evaluate(&self, proposal: &Proposal) -> ApprovalDecision {
        let Some(rule) = self.find_rule(&proposal.action_type, proposal.risk_level) else {
            debug!(
                action_type = %proposal.action_type,
                risk_level = %proposal.risk_level,
                "No policy matched"
            );
            return ApprovalDecision {
                approved: false,
                requires_approval: true,
                requires_two_approvals: false,
                reason: "No matching policy; manual approval required".to_string(),
                policy_matched: None,
                cooldown_seconds: None,
            };
        };

        let mut decision = ApprovalDecision {
            approved: rule.auto_approve,
            requires_approval: !rule.auto_approve,
            requires_two_approvals: rule.require_two_approvals,
            reason: if rule.auto_approve {
                format!("Auto-approved by policy '{}'", rule.action_type_pattern)
            } else {
                format!(
                    "Policy '{}' requires manual approval",
                    rule.action_type_pattern
                )
            },
            policy_matched: Some(rule.action_type_pattern.clone()),
            cooldown_seconds: rule.cooldown_seconds,
        };

        if proposal.confidence_score < self.confidence_floor {
            decision.approved = false;
            decision.requires_approval = true;
            decision.reason = format!(
                "Confidence {:.2} below {:.2}; manual approval required",
                proposal.confidence_score, self.confidence_floor
            );
        }

        debug!(
            action_type = %proposal.action_type,
            policy = %rule.action_type_pattern,
            approved = decision.approved,
            reason = %decision.reason,
            "Policy evaluated"
        );
        decision
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}
