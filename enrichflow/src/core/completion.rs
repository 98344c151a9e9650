//! Completion records: the durable per-entity-per-stage outcome log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CompletionStatus, EntityType, RunScope};

/// Unique key of a completion record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionKey {
    /// The pipeline run.
    pub pipeline_run_id: String,
    /// The entity.
    pub entity_id: String,
    /// The stage code.
    pub stage: String,
}

impl CompletionKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        pipeline_run_id: impl Into<String>,
        entity_id: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_run_id: pipeline_run_id.into(),
            entity_id: entity_id.into(),
            stage: stage.into(),
        }
    }
}

/// The fact "entity X reached outcome Y for stage Z in run R".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// The pipeline run.
    pub pipeline_run_id: String,
    /// Tenant of the entity.
    pub tenant_id: String,
    /// Scope of the run.
    pub scope_id: String,
    /// Entity type of the stage.
    pub entity_type: EntityType,
    /// The entity.
    pub entity_id: String,
    /// The stage code.
    pub stage: String,
    /// The outcome.
    pub status: CompletionStatus,
    /// Handler cost attributed to this entity.
    pub cost: f64,
    /// Error or rejection text.
    pub error: Option<String>,
    /// When the outcome was recorded.
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        scope: &RunScope,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        stage: impl Into<String>,
        status: CompletionStatus,
    ) -> Self {
        Self {
            pipeline_run_id: scope.pipeline_run_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            scope_id: scope.scope_id.clone(),
            entity_type,
            entity_id: entity_id.into(),
            stage: stage.into(),
            status,
            cost: 0.0,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns the unique key of this record.
    #[must_use]
    pub fn key(&self) -> CompletionKey {
        CompletionKey::new(&self.pipeline_run_id, &self.entity_id, &self.stage)
    }
}
