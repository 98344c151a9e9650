//! Persistence for entities, completion records and run state.
//!
//! [`PipelineStore`] is the single seam every component writes through.
//! Two backends ship with the crate:
//!
//! - [`InMemoryStore`]: concurrent maps for tests and embedded use
//! - `SqliteStore` (feature `sqlite`): a durable single-file database

mod memory;
#[cfg(feature = "sqlite")]
mod migrations;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::core::{
    CompletionKey, CompletionRecord, Entity, PipelineRun, RunStatus, StageProgress, StageRun,
};
use crate::eligibility::EligibilityQuery;
use crate::errors::StoreError;

/// Storage operations used by the engine, workers and coordinator.
///
/// Status transitions are compare-and-set: they apply only when the current
/// status is one of `from` and report whether they applied. Entering a
/// terminal status stamps `finished_at`; entering `running` stamps
/// `started_at` once.
#[async_trait]
pub trait PipelineStore: Send + Sync + Debug {
    /// Inserts or replaces an entity.
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Loads an entity by id.
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError>;

    /// Inserts or updates the record for `record.key()`.
    ///
    /// Concurrent upserts of one key leave exactly one record.
    async fn upsert_completion(&self, record: &CompletionRecord) -> Result<(), StoreError>;

    /// Loads a completion record by key.
    async fn get_completion(
        &self,
        key: &CompletionKey,
    ) -> Result<Option<CompletionRecord>, StoreError>;

    /// Lists all records of a pipeline run ordered by stage then entity.
    async fn list_completions(
        &self,
        pipeline_run_id: &str,
    ) -> Result<Vec<CompletionRecord>, StoreError>;

    /// Returns ids of entities matching the query, ordered by name then id.
    async fn select_entity_ids(&self, query: &EligibilityQuery, limit: Option<usize>)
        -> Result<Vec<String>, StoreError>;

    /// Counts entities matching the query.
    async fn count_entities(&self, query: &EligibilityQuery) -> Result<u64, StoreError>;

    /// Inserts a new pipeline run.
    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a pipeline run by id.
    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError>;

    /// Returns the most recently created pipeline run for a tenant scope.
    async fn latest_pipeline_run(&self, tenant_id: &str, scope_id: &str)
        -> Result<Option<PipelineRun>, StoreError>;

    /// Compare-and-set status transition of a pipeline run.
    async fn transition_pipeline_run(&self, id: &str, from: &[RunStatus], to: RunStatus)
        -> Result<bool, StoreError>;

    /// Overwrites the aggregated cost of a pipeline run.
    async fn set_pipeline_run_cost(&self, id: &str, cost: f64) -> Result<(), StoreError>;

    /// Inserts a new stage run.
    async fn insert_stage_run(&self, run: &StageRun) -> Result<(), StoreError>;

    /// Loads a stage run by id.
    async fn get_stage_run(&self, id: &str) -> Result<Option<StageRun>, StoreError>;

    /// Lists the stage runs of a pipeline run in creation order.
    async fn list_stage_runs(&self, pipeline_run_id: &str) -> Result<Vec<StageRun>, StoreError>;

    /// Overwrites progress counters without touching status.
    async fn update_stage_progress(
        &self,
        id: &str,
        progress: &StageProgress,
    ) -> Result<(), StoreError>;

    /// Compare-and-set status transition of a stage run.
    ///
    /// `error` replaces the stored error text when given.
    async fn transition_stage_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;
}
