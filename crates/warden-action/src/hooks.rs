//! Lifecycle hooks around handler dispatch.
//!
//! Hooks run synchronously in registration order. A failing before-hook
//! aborts the execution attempt; after- and error-hook failures are logged
//! and never change the persisted result. Panics count as failures.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::error::GovernanceError;
use warden_core::types::{ActionResult, Proposal};

pub type BeforeHook = Box<dyn Fn(&Proposal) -> Result<(), String> + Send + Sync>;
pub type ResultHook = Box<dyn Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    before: Vec<BeforeHook>,
    after: Vec<ResultHook>,
    on_error: Vec<ResultHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_before<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal) -> Result<(), String> + Send + Sync + 'static,
    {
        self.before.push(Box::new(hook));
    }

    pub fn register_after<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.after.push(Box::new(hook));
    }

    pub fn register_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_error.push(Box::new(hook));
    }

    /// Run before-hooks, stopping at the first failure.
    pub fn run_before(&self, proposal: &Proposal) -> Result<(), GovernanceError> {
        for (i, hook) in self.before.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook(proposal)))
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));
            if let Err(e) = outcome {
                warn!(
                    action_id = %proposal.id,
                    hook_index = i,
                    error = %e,
                    "Before-execute hook failed; execution aborted"
                );
                return Err(GovernanceError::HookFailed(e));
            }
        }
        Ok(())
    }

    pub fn run_after(&self, proposal: &Proposal, result: &ActionResult) {
        run_best_effort(&self.after, "after-execute", proposal, result);
    }

    pub fn run_on_error(&self, proposal: &Proposal, result: &ActionResult) {
        run_best_effort(&self.on_error, "on-error", proposal, result);
    }
}

fn run_best_effort(hooks: &[ResultHook], kind: &str, proposal: &Proposal, result: &ActionResult) {
    for (i, hook) in hooks.iter().enumerate() {
        let outcome = catch_unwind(AssertUnwindSafe(|| hook(proposal, result)))
            .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));
        if let Err(e) = outcome {
            warn!(
                action_id = %proposal.id,
                hook = kind,
                hook_index = i,
                error = %e,
                "Hook failed; ignoring"
            );
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
