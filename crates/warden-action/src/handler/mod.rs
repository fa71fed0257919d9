//! Action handler trait and registry.
//!
//! Handlers are supplied by the embedding application, one per action type.
//! The router resolves them by string tag at dispatch time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ActionError;
use warden_core::types::ActionResult;

/// What a handler may return.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// A fully formed result. `action_id` and timing are overwritten by the
    /// router.
    Result(ActionResult),
    /// A JSON object carrying at least a boolean `success`. Optional `error`
    /// and `side_effects` keys are lifted out; everything else becomes
    /// `result_data`.
    Map(Value),
}

impl From<ActionResult> for HandlerOutput {
    fn from(result: ActionResult) -> Self {
        HandlerOutput::Result(result)
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Map(value)
    }
}

impl HandlerOutput {
    /// Normalize into an `ActionResult` for `action_id`.
    ///
    /// A map without a boolean `success` is treated as a failure.
    pub fn into_result(self, action_id: Uuid, execution_time_ms: u64) -> ActionResult {
        match self {
            HandlerOutput::Result(mut result) => {
                result.action_id = action_id;
                result.execution_time_ms = execution_time_ms;
                result
            }
            HandlerOutput::Map(Value::Object(mut map)) => {
                let Some(success) = map.remove("success").and_then(|v| v.as_bool()) else {
                    return ActionResult::failure(
                        action_id,
                        "Handler output is missing a boolean 'success' field",
                        execution_time_ms,
                    );
                };
                let error = match map.remove("error") {
                    Some(Value::String(s)) => Some(s),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                let side_effects = match map.remove("side_effects") {
                    Some(Value::Array(items)) => items,
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other],
                };
                ActionResult {
                    action_id,
                    success,
                    result_data: Value::Object(map),
                    error,
                    execution_time_ms,
                    side_effects,
                    executed_at: chrono::Utc::now(),
                }
            }
            HandlerOutput::Map(other) => ActionResult::failure(
                action_id,
                format!("Handler output must be a JSON object, got {}", other),
                execution_time_ms,
            ),
        }
    }
}

/// Trait implemented by every action handler.
///
/// The router invokes `execute` at most once per proposal and never retries.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the side effect described by `payload`.
    async fn execute(&self, payload: &Value) -> Result<HandlerOutput, ActionError>;

    /// Human-readable description of what `execute` would do, logged when
    /// the router starts the action. The default names the payload fields
    /// without their values.
    fn describe(&self, payload: &Value) -> String {
        let fields: Vec<&str> = payload
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        format!("Execute with fields [{}]", fields.join(", "))
    }
}

/// Adapter turning an async closure into an `ActionHandler`.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler. The closure receives an owned copy of the payload.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, ActionError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, ActionError>> + Send + 'static,
{
    async fn execute(&self, payload: &Value) -> Result<HandlerOutput, ActionError> {
        (self.f)(payload.clone()).await
    }
}

/// A handler plus its optional per-type rate limit.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn ActionHandler>,
    pub rate_limit_per_minute: Option<u32>,
}

/// Lookup table from action type to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action_type`, replacing any previous one.
    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
        rate_limit_per_minute: Option<u32>,
    ) {
        self.handlers.insert(
            action_type.into(),
            RegisteredHandler {
                handler,
                rate_limit_per_minute,
            },
        );
    }

    pub fn get(&self, action_type: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(action_type)
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered action types, sorted.
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
