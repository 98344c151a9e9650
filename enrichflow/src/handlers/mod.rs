//! Stage handlers: the per-entity units of enrichment work.
//!
//! The scheduler never looks inside a handler. A handler receives the entity
//! id and run context and reports a cost, an optional gate rejection, or an
//! error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{EntityType, RunScope};
use crate::errors::{EnrichflowError, HandlerError};

/// Input passed to a handler for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerContext {
    /// The entity to process.
    pub entity_id: String,
    /// Stage code.
    pub stage: String,
    /// Entity type of the stage.
    pub entity_type: EntityType,
    /// Tenant, scope and run.
    pub scope: RunScope,
    /// Opaque run-level handler context.
    pub context: Option<Value>,
}

/// Result of a successful handler call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Cost attributed to this entity.
    pub cost: f64,
    /// Set when a gate handler rejects the entity.
    pub rejection: Option<String>,
    /// Handler-specific data, logged and forwarded on item events but not
    /// interpreted.
    pub data: Option<Value>,
}

impl HandlerOutput {
    /// A successful zero-cost output.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A gate rejection with a reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            rejection: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets handler data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns true if the entity was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// A stage's per-entity work.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Processes one entity.
    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError>;
}

/// A handler backed by a synchronous closure.
pub struct FnHandler<F>
where
    F: Fn(&HandlerContext) -> Result<HandlerOutput, HandlerError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&HandlerContext) -> Result<HandlerOutput, HandlerError> + Send + Sync,
{
    /// Creates a closure handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnHandler<F>
where
    F: Fn(&HandlerContext) -> Result<HandlerOutput, HandlerError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StageHandler for FnHandler<F>
where
    F: Fn(&HandlerContext) -> Result<HandlerOutput, HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        (self.func)(ctx)
    }
}

/// A handler that succeeds immediately at zero cost.
#[derive(Debug, Clone, Default)]
pub struct NoOpHandler;

#[async_trait]
impl StageHandler for NoOpHandler {
    async fn handle(&self, _ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::ok())
    }
}

/// Lookup from stage code to handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `stage`, replacing any previous one.
    pub fn register(&mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, stage: impl Into<String>, handler: impl StageHandler + 'static) -> Self {
        self.register(stage, Arc::new(handler));
        self
    }

    /// Returns the handler for `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::UnknownHandler`] if none is registered.
    pub fn get(&self, stage: &str) -> Result<Arc<dyn StageHandler>, EnrichflowError> {
        self.handlers
            .get(stage)
            .cloned()
            .ok_or_else(|| EnrichflowError::UnknownHandler {
                stage: stage.to_string(),
            })
    }

    /// Returns true if a handler is registered for `stage`.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.handlers.contains_key(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandlerContext {
        HandlerContext {
            entity_id: "c1".to_string(),
            stage: "l1".to_string(),
            entity_type: EntityType::Company,
            scope: RunScope::new("t1", "s1", "r1"),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new("priced", |ctx: &HandlerContext| {
            Ok(HandlerOutput::ok()
                .with_cost(0.25)
                .with_data(serde_json::json!({ "entity": ctx.entity_id })))
        });

        let output = handler.handle(&ctx()).await.unwrap();
        assert_eq!(output.cost, 0.25);
        assert!(!output.is_rejected());
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let output = NoOpHandler.handle(&ctx()).await.unwrap();
        assert_eq!(output, HandlerOutput::ok());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new().with("l1", NoOpHandler);

        assert!(registry.contains("l1"));
        assert!(registry.get("l1").is_ok());
        assert!(matches!(
            registry.get("l2"),
            Err(EnrichflowError::UnknownHandler { ref stage }) if stage == "l2"
        ));
    }

    #[test]
    fn test_rejected_output() {
        let output = HandlerOutput::rejected("not a fit").with_cost(0.1);
        assert!(output.is_rejected());
        assert_eq!(output.rejection.as_deref(), Some("not a fit"));
    }
}
