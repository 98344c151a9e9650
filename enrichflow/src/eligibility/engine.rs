//! Eligibility queries and country-gate auto-skipping.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EligibilityFilter, EligibilityQuery};
use crate::completion::CompletionRecorder;
use crate::core::{CompletionRecord, CompletionStatus, RunScope};
use crate::errors::{EnrichflowError, RegistryError};
use crate::registry::StageRegistry;
use crate::store::PipelineStore;

/// Answers which entities may run a stage in a run.
///
/// An entity is eligible for stage `S` in run `R` when it belongs to the
/// run's tenant and scope, has the stage's entity type, has no record for
/// `S` in `R`, every resolved dependency is satisfied (completed or skipped,
/// in any run of the tenant), and it passes the owner, tier and gate filters.
#[derive(Debug, Clone)]
pub struct EligibilityEngine {
    registry: Arc<StageRegistry>,
    store: Arc<dyn PipelineStore>,
    recorder: CompletionRecorder,
}

impl EligibilityEngine {
    /// Creates an engine over a registry and store.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn PipelineStore>) -> Self {
        let recorder = CompletionRecorder::new(Arc::clone(&store));
        Self {
            registry,
            store,
            recorder,
        }
    }

    /// Returns the registry the engine resolves stages against.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Returns up to `limit` eligible entity ids ordered by name then id.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown stages or store failures.
    pub async fn get_eligible_ids(
        &self,
        stage: &str,
        scope: &RunScope,
        filter: &EligibilityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<String>, EnrichflowError> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let query = EligibilityQuery::eligible(&self.registry, stage, scope, filter)
            .map_err(RegistryError::from)?;
        let ids = self.store.select_entity_ids(&query, limit).await?;
        debug!(
            stage,
            pipeline_run_id = %scope.pipeline_run_id,
            eligible = ids.len(),
            "Eligibility query"
        );
        Ok(ids)
    }

    /// Counts eligible entities with the same predicate as
    /// [`get_eligible_ids`](Self::get_eligible_ids).
    ///
    /// # Errors
    ///
    /// Returns an error for unknown stages or store failures.
    pub async fn count_eligible(
        &self,
        stage: &str,
        scope: &RunScope,
        filter: &EligibilityFilter,
    ) -> Result<u64, EnrichflowError> {
        let query = EligibilityQuery::eligible(&self.registry, stage, scope, filter)
            .map_err(RegistryError::from)?;
        Ok(self.store.count_entities(&query).await?)
    }

    /// Records a `skipped` outcome for every undecided entity in scope that
    /// fails the stage's gate, so dependents are not blocked by it.
    ///
    /// Stages without a gate are a no-op. Failures are logged; the return
    /// value is the number of records written.
    pub async fn auto_skip_country_gated(&self, stage: &str, scope: &RunScope) -> usize {
        let query = match EligibilityQuery::gate_rejected(&self.registry, stage, scope) {
            Ok(Some(query)) => query,
            Ok(None) => return 0,
            Err(e) => {
                warn!(stage, error = %e, "Auto-skip skipped: unknown stage");
                return 0;
            }
        };

        let ids = match self.store.select_entity_ids(&query, None).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    stage,
                    pipeline_run_id = %scope.pipeline_run_id,
                    error = %e,
                    "Auto-skip query failed"
                );
                return 0;
            }
        };

        let mut skipped = 0;
        for id in &ids {
            let record = CompletionRecord::new(
                scope,
                query.entity_type,
                id.as_str(),
                stage,
                CompletionStatus::Skipped,
            )
            .with_error("country gate");
            if self.recorder.record(&record).await {
                skipped += 1;
            }
        }

        if skipped > 0 {
            info!(
                stage,
                pipeline_run_id = %scope.pipeline_run_id,
                skipped,
                "Auto-skipped gated entities"
            );
        }
        skipped
    }
}
