//! In-memory store backed by concurrent maps.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::PipelineStore;
use crate::core::{
    CompletionKey, CompletionRecord, Entity, PipelineRun, RunStatus, StageProgress, StageRun,
};
use crate::eligibility::{CompletionLookup, EligibilityQuery};
use crate::errors::StoreError;

/// In-memory [`PipelineStore`].
///
/// Completion upserts are atomic per key. A secondary index from
/// `(entity, stage)` to run ids serves cross-run dependency lookups.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entities: RwLock<HashMap<String, Entity>>,
    completions: DashMap<CompletionKey, CompletionRecord>,
    by_entity_stage: DashMap<(String, String), HashSet<String>>,
    pipeline_runs: DashMap<String, PipelineRun>,
    stage_runs: DashMap<String, StageRun>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of completion records.
    #[must_use]
    pub fn completion_count(&self) -> usize {
        self.completions.len()
    }

    fn matching(&self, query: &EligibilityQuery) -> Vec<(String, String)> {
        let entities = self.entities.read();
        let mut matched: Vec<(String, String)> = entities
            .values()
            .filter(|entity| {
                let parent = entity.parent_id.as_ref().and_then(|id| entities.get(id));
                query.matches(entity, parent, self)
            })
            .map(|entity| (entity.name.clone(), entity.id.clone()))
            .collect();
        matched.sort();
        matched
    }
}

impl CompletionLookup for InMemoryStore {
    fn is_decided(&self, pipeline_run_id: &str, entity_id: &str, stage: &str) -> bool {
        self.completions
            .contains_key(&CompletionKey::new(pipeline_run_id, entity_id, stage))
    }

    fn is_satisfied(&self, tenant_id: &str, entity_id: &str, stage: &str) -> bool {
        let Some(runs) = self
            .by_entity_stage
            .get(&(entity_id.to_string(), stage.to_string()))
        else {
            return false;
        };
        runs.iter().any(|run_id| {
            self.completions
                .get(&CompletionKey::new(run_id, entity_id, stage))
                .is_some_and(|record| {
                    record.tenant_id == tenant_id && record.status.satisfies_dependency()
                })
        })
    }
}

fn apply_transition(status: &mut RunStatus, from: &[RunStatus], to: RunStatus) -> bool {
    if from.contains(status) {
        *status = to;
        true
    } else {
        false
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entities
            .write()
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.entities.read().get(id).cloned())
    }

    async fn upsert_completion(&self, record: &CompletionRecord) -> Result<(), StoreError> {
        self.completions.insert(record.key(), record.clone());
        self.by_entity_stage
            .entry((record.entity_id.clone(), record.stage.clone()))
            .or_default()
            .insert(record.pipeline_run_id.clone());
        Ok(())
    }

    async fn get_completion(
        &self,
        key: &CompletionKey,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        Ok(self.completions.get(key).map(|r| r.value().clone()))
    }

    async fn list_completions(
        &self,
        pipeline_run_id: &str,
    ) -> Result<Vec<CompletionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .completions
            .iter()
            .filter(|r| r.pipeline_run_id == pipeline_run_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.entity_id.cmp(&b.entity_id)));
        Ok(records)
    }

    async fn select_entity_ids(
        &self,
        query: &EligibilityQuery,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let ids = self.matching(query).into_iter().map(|(_, id)| id);
        Ok(match limit {
            Some(limit) => ids.take(limit).collect(),
            None => ids.collect(),
        })
    }

    async fn count_entities(&self, query: &EligibilityQuery) -> Result<u64, StoreError> {
        Ok(self.matching(query).len() as u64)
    }

    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.pipeline_runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.pipeline_runs.get(id).map(|r| r.value().clone()))
    }

    async fn latest_pipeline_run(
        &self,
        tenant_id: &str,
        scope_id: &str,
    ) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self
            .pipeline_runs
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.scope_id == scope_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|r| r.value().clone()))
    }

    async fn transition_pipeline_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut run = self
            .pipeline_runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pipeline run", id))?;
        let applied = apply_transition(&mut run.status, from, to);
        if applied {
            let now = Utc::now();
            run.updated_at = now;
            if to.is_terminal() {
                run.finished_at = Some(now);
            }
        }
        Ok(applied)
    }

    async fn set_pipeline_run_cost(&self, id: &str, cost: f64) -> Result<(), StoreError> {
        let mut run = self
            .pipeline_runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pipeline run", id))?;
        run.cost = cost;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_stage_run(&self, run: &StageRun) -> Result<(), StoreError> {
        self.stage_runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_stage_run(&self, id: &str) -> Result<Option<StageRun>, StoreError> {
        Ok(self.stage_runs.get(id).map(|r| r.value().clone()))
    }

    async fn list_stage_runs(&self, pipeline_run_id: &str) -> Result<Vec<StageRun>, StoreError> {
        let mut runs: Vec<_> = self
            .stage_runs
            .iter()
            .filter(|r| r.pipeline_run_id == pipeline_run_id)
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn update_stage_progress(
        &self,
        id: &str,
        progress: &StageProgress,
    ) -> Result<(), StoreError> {
        let mut run = self
            .stage_runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("stage run", id))?;
        run.progress = progress.clone();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_stage_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut run = self
            .stage_runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("stage run", id))?;
        let applied = apply_transition(&mut run.status, from, to);
        if applied {
            let now = Utc::now();
            run.updated_at = now;
            if to == RunStatus::Running && run.started_at.is_none() {
                run.started_at = Some(now);
            }
            if to.is_terminal() {
                run.finished_at = Some(now);
            }
            if let Some(error) = error {
                run.error = Some(error.to_string());
            }
        }
        Ok(applied)
    }
}
