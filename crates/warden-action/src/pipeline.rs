//! Governance pipeline facade.
//!
//! Wires the lifecycle manager, execution router and query surface over one
//! shared store. Build it, register handlers and hooks, then share it behind
//! an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::GovernanceError;
use crate::handler::ActionHandler;
use crate::lifecycle::{LifecycleManager, ProposeRequest};
use crate::policy::PolicyEngine;
use crate::query::ProposalQueries;
use crate::router::ExecutionRouter;
use warden_core::config::WardenConfig;
use warden_core::types::{ActionResult, Proposal, ProposalStatus};
use warden_storage::{Database, MemoryProposalStore, ProposalStore, SqliteProposalStore};

pub struct GovernancePipeline {
    store: Arc<dyn ProposalStore>,
    lifecycle: LifecycleManager,
    router: ExecutionRouter,
    queries: ProposalQueries,
}

impl GovernancePipeline {
    /// Build a pipeline over `store`. Fails if `config` does not validate.
    pub fn new(
        store: Arc<dyn ProposalStore>,
        config: &WardenConfig,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        let lifecycle = LifecycleManager::new(
            Arc::clone(&store),
            PolicyEngine::from_config(&config.policy),
            config.governance.system_approver.clone(),
        );
        let router = ExecutionRouter::new(Arc::clone(&store), &config.governance);
        let queries = ProposalQueries::new(Arc::clone(&store));
        Ok(Self {
            store,
            lifecycle,
            router,
            queries,
        })
    }

    /// Open the SQLite store at `config.db_path()`, creating it if needed.
    pub fn open(config: &WardenConfig) -> Result<Self, GovernanceError> {
        config.validate()?;
        let path = config.db_path();
        let db = Arc::new(Database::new(&path)?);
        info!(path = %path.display(), rules = config.policy.rules.len(), "Governance pipeline opened");
        Self::new(Arc::new(SqliteProposalStore::new(db)), config)
    }

    /// Pipeline over a process-local store.
    pub fn in_memory(config: &WardenConfig) -> Result<Self, GovernanceError> {
        Self::new(Arc::new(MemoryProposalStore::new()), config)
    }

    // ---- registration ----

    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
        rate_limit_per_minute: Option<u32>,
    ) {
        self.router.register(action_type, handler, rate_limit_per_minute);
    }

    pub fn register_before<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal) -> Result<(), String> + Send + Sync + 'static,
    {
        self.router.register_before(hook);
    }

    pub fn register_after<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.router.register_after(hook);
    }

    pub fn register_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&Proposal, &ActionResult) -> Result<(), String> + Send + Sync + 'static,
    {
        self.router.register_on_error(hook);
    }

    // ---- lifecycle ----

    pub fn propose(&self, request: ProposeRequest) -> Result<Uuid, GovernanceError> {
        self.lifecycle.propose(request)
    }

    pub fn approve(
        &self,
        id: Uuid,
        approved_by: &str,
        additional_context: Option<Value>,
    ) -> Result<bool, GovernanceError> {
        self.lifecycle.approve(id, approved_by, additional_context)
    }

    pub fn reject(&self, id: Uuid, rejected_by: &str, reason: &str) -> Result<bool, GovernanceError> {
        self.lifecycle.reject(id, rejected_by, reason)
    }

    // ---- execution ----

    pub async fn execute(&self, id: Uuid, dry_run: bool) -> Result<ActionResult, GovernanceError> {
        self.router.execute(id, dry_run).await
    }

    pub async fn execute_with_timeout(
        &self,
        id: Uuid,
        dry_run: bool,
        timeout: Duration,
    ) -> Result<ActionResult, GovernanceError> {
        self.router.execute_with_timeout(id, dry_run, timeout).await
    }

    // ---- queries ----

    pub fn list_pending(
        &self,
        status: Option<ProposalStatus>,
        action_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Proposal>, GovernanceError> {
        self.queries.list_pending(status, action_type, limit)
    }

    pub fn list_history(
        &self,
        entity_id: Option<&str>,
        action_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Proposal>, GovernanceError> {
        self.queries.list_history(entity_id, action_type, limit)
    }

    pub fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, GovernanceError> {
        self.lifecycle.get(id)
    }

    pub fn get_result(&self, id: Uuid) -> Result<Option<ActionResult>, GovernanceError> {
        Ok(self.store.get_result(id)?)
    }

    pub fn policy(&self) -> &PolicyEngine {
        self.lifecycle.policy()
    }
}
