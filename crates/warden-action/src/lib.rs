//! Action governance for Warden.
//!
//! Producers propose side-effecting actions, a risk-based policy decides
//! between auto-approval and human review, and the execution router
//! dispatches approved proposals to pluggable handlers under rate limits,
//! hooks and timeouts.

pub mod error;
pub mod handler;
pub mod hooks;
pub mod lifecycle;
pub mod pipeline;
pub mod policy;
pub mod query;
pub mod rate_limit;
pub mod router;
pub mod state_machine;

pub use error::{ActionError, GovernanceError};
pub use handler::{handler_fn, ActionHandler, FnHandler, HandlerOutput, HandlerRegistry};
pub use hooks::HookRegistry;
pub use lifecycle::{LifecycleManager, ProposeRequest};
pub use pipeline::GovernancePipeline;
pub use policy::PolicyEngine;
pub use query::ProposalQueries;
pub use rate_limit::RateLimiter;
pub use router::ExecutionRouter;
