//! Execution router.
//!
//! Takes an approved proposal through rate limiting, handler lookup and
//! before-hooks, claims it with an `approved -> executing` compare-and-swap,
//! runs the handler (or a dry run) under a timeout, and persists exactly one
//! terminal result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ActionError, GovernanceError};
use crate::handler::{ActionHandler, HandlerRegistry};
use crate::hooks::{panic_message, HookRegistry};
use crate::rate_limit::RateLimiter;
use crate::state_machine::validate_transition;
use warden_core::config::GovernanceConfig;
use warden_core::types::{ActionResult, Proposal, ProposalStatus};
use warden_storage::{ProposalPatch, ProposalStore};

pub struct ExecutionRouter {
    store: Arc<dyn ProposalStore>,
    handlers: HandlerRegistry,
    hooks: HookRegistry,
    limiter: RateLimiter,
    default_rate_limit: u32,
    default_timeout: Duration,
}

impl ExecutionRouter {
    pub fn new(store: Arc<dyn ProposalStore>, config: &GovernanceConfig) -> Self {
        Self {
            store,
            handlers: HandlerRegistry::new(),
            hooks: HookRegistry::new(),
            limiter: RateLimiter::new(Duration::from_secs(config.rate_limit_window_secs)),
            default_rate_limit: config.default_rate_limit_per_minute,
            default_timeout: Duration::from_secs(config.handler_timeout_secs),
        }
    }

    /// Register the handler for `action_type`. Without a per-type limit the
    /// configured default applies.
    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
        rate_limit_per_minute: Option<u32>,
    ) {
        let action_type = action_type.into();
        info!(action_type = %action_type, rate_limit = ?rate_limit_per_minute, "Handler registered");
        self.handlers.register(action_type, handler, rate_limit_per_minute);
    }

    pub fn register_before<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.register_before(hook);
    }

    pub fn register_after<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.register_after(hook);
    }

    pub fn register_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.register_on_error(hook);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Execute with the configured handler timeout.
    pub async fn execute(&self, id: Uuid, dry_run: bool) -> Result<ActionResult, GovernanceError> {
        self.execute_with_timeout(id, dry_run, self.default_timeout)
            .await
    }

    /// Execute an approved proposal.
    ///
    /// Errors before the `executing` claim leave the proposal `approved`.
    /// Once claimed, handler failures, panics and timeouts all become a
    /// persisted `failed` result and are returned as `Ok`.
    pub async fn execute_with_timeout(
        &self,
        id: Uuid,
        dry_run: bool,
        timeout: Duration,
    ) -> Result<ActionResult, GovernanceError> {
        let mut proposal = self
            .store
            .get_proposal(id)?
            .ok_or(GovernanceError::NotFound(id))?;
        validate_transition(proposal.status, ProposalStatus::Executing)?;

        let registered = self.handlers.get(&proposal.action_type);
        let limit = registered
            .and_then(|r| r.rate_limit_per_minute)
            .unwrap_or(self.default_rate_limit);
        if !self.limiter.try_acquire(&proposal.action_type, limit) {
            warn!(
                action_id = %id,
                action_type = %proposal.action_type,
                max_per_minute = limit,
                "Rate limit exceeded"
            );
            return Err(GovernanceError::RateLimited {
                action_type: proposal.action_type,
                max_per_minute: limit,
            });
        }

        let handler = match registered {
            Some(r) => Arc::clone(&r.handler),
            None => {
                warn!(action_id = %id, action_type = %proposal.action_type, "No handler registered");
                return Err(GovernanceError::NoHandler(proposal.action_type));
            }
        };

        self.hooks.run_before(&proposal)?;

        let claimed = self.store.update_if(
            id,
            ProposalStatus::Approved,
            &ProposalPatch::status(ProposalStatus::Executing),
        )?;
        if !claimed {
            let current = self
                .store
                .get_proposal(id)?
                .ok_or(GovernanceError::NotFound(id))?
                .status;
            warn!(action_id = %id, status = %current, "Execution already claimed");
            return Err(GovernanceError::InvalidTransition(
                current,
                ProposalStatus::Executing,
            ));
        }
        proposal.status = ProposalStatus::Executing;
        info!(
            action_id = %id,
            action_type = %proposal.action_type,
            description = %handler.describe(&proposal.payload),
            dry_run,
            "Executing action"
        );

        let (result, raised) = if dry_run {
            (dry_run_result(&proposal), false)
        } else {
            invoke(handler, &proposal, timeout).await
        };

        if raised {
            warn!(
                action_id = %id,
                action_type = %proposal.action_type,
                error = result.error.as_deref().unwrap_or_default(),
                "Action handler failed"
            );
            self.hooks.run_on_error(&proposal, &result);
        }

        let terminal = if result.success {
            ProposalStatus::Success
        } else {
            ProposalStatus::Failed
        };
        match self.store.record_result(&result, terminal) {
            Ok(true) => {}
            Ok(false) => {
                error!(action_id = %id, "Proposal left executing before its result was recorded");
            }
            Err(e) => {
                error!(action_id = %id, error = %e, "Failed to record action result");
                self.abandon(id);
                return Err(e.into());
            }
        }
        proposal.status = terminal;

        info!(
            action_id = %id,
            action_type = %proposal.action_type,
            success = result.success,
            execution_time_ms = result.execution_time_ms,
            dry_run,
            "Action finished"
        );

        self.hooks.run_after(&proposal, &result);
        Ok(result)
    }

    /// Move a claimed proposal to `failed` when its result could not be
    /// recorded, so it never stays `executing`.
    fn abandon(&self, id: Uuid) {
        match self.store.update_if(
            id,
            ProposalStatus::Executing,
            &ProposalPatch::status(ProposalStatus::Failed),
        ) {
            Ok(true) => warn!(action_id = %id, "Proposal marked failed without a stored result"),
            Ok(false) => {}
            Err(e) => error!(action_id = %id, error = %e, "Failed to mark proposal failed"),
        }
    }
}

fn dry_run_result(proposal: &Proposal) -> ActionResult {
    ActionResult {
        action_id: proposal.id,
        success: true,
        result_data: json!({"dry_run": true, "payload": proposal.payload}),
        error: None,
        execution_time_ms: 0,
        side_effects: Vec::new(),
        executed_at: Utc::now(),
    }
}

/// Run the handler on its own task so a panic or a stuck handler cannot take
/// the router down with it. The bool is true when the handler raised.
async fn invoke(
    handler: Arc<dyn ActionHandler>,
    proposal: &Proposal,
    timeout: Duration,
) -> (ActionResult, bool) {
    let id = proposal.id;
    let payload = proposal.payload.clone();
    let started = Instant::now();
    let mut task = tokio::spawn(async move { handler.execute(&payload).await });
    let outcome = tokio::time::timeout(timeout, &mut task).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(Ok(Ok(output))) => (output.into_result(id, elapsed_ms), false),
        Ok(Ok(Err(e))) => (ActionResult::failure(id, e.into_message(), elapsed_ms), true),
        Ok(Err(join_err)) => {
            let message = if join_err.is_panic() {
                format!("Action handler {}", panic_message(join_err.into_panic().as_ref()))
            } else {
                join_err.to_string()
            };
            (ActionResult::failure(id, message, elapsed_ms), true)
        }
        Err(_) => {
            task.abort();
            let message = ActionError::Timeout(timeout).into_message();
            (ActionResult::failure(id, message, elapsed_ms), true)
        }
    }
}
