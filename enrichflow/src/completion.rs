//! Writes completion records without ever failing the caller.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{CompletionRecord, CompletionStatus, EntityType, RunScope};
use crate::store::PipelineStore;

/// Records per-entity stage outcomes.
///
/// Store failures are logged and swallowed so a worker keeps moving.
#[derive(Debug, Clone)]
pub struct CompletionRecorder {
    store: Arc<dyn PipelineStore>,
}

impl CompletionRecorder {
    /// Creates a recorder writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Upserts the outcome of `stage` for `entity_id` in the run.
    ///
    /// Returns true if the record was persisted.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_completion(
        &self,
        scope: &RunScope,
        entity_type: EntityType,
        entity_id: &str,
        stage: &str,
        status: CompletionStatus,
        cost: f64,
        error: Option<&str>,
    ) -> bool {
        let mut record =
            CompletionRecord::new(scope, entity_type, entity_id, stage, status).with_cost(cost);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        self.record(&record).await
    }

    /// Upserts a prepared record.
    ///
    /// Returns true if the record was persisted.
    pub async fn record(&self, record: &CompletionRecord) -> bool {
        match self.store.upsert_completion(record).await {
            Ok(()) => {
                debug!(
                    pipeline_run_id = %record.pipeline_run_id,
                    entity_id = %record.entity_id,
                    stage = %record.stage,
                    status = %record.status,
                    "Recorded completion"
                );
                true
            }
            Err(e) => {
                warn!(
                    pipeline_run_id = %record.pipeline_run_id,
                    entity_id = %record.entity_id,
                    stage = %record.stage,
                    status = %record.status,
                    error = %e,
                    "Failed to record completion"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompletionKey;
    use crate::store::InMemoryStore;
    use crate::testing::FailingStore;

    #[tokio::test]
    async fn test_record_completion_persists() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = CompletionRecorder::new(store.clone());
        let scope = RunScope::new("t1", "s1", "r1");

        assert!(
            recorder
                .record_completion(
                    &scope,
                    EntityType::Company,
                    "c1",
                    "l1",
                    CompletionStatus::Failed,
                    0.2,
                    Some("timeout"),
                )
                .await
        );
        assert!(
            recorder
                .record_completion(
                    &scope,
                    EntityType::Company,
                    "c1",
                    "l1",
                    CompletionStatus::Completed,
                    0.4,
                    None,
                )
                .await
        );

        let record = store
            .get_completion(&CompletionKey::new("r1", "c1", "l1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, CompletionStatus::Completed);
        assert_eq!(record.cost, 0.4);
        assert_eq!(store.completion_count(), 1);
    }

    #[tokio::test]
    async fn test_record_completion_swallows_store_errors() {
        let recorder = CompletionRecorder::new(Arc::new(FailingStore::new()));
        let scope = RunScope::new("t1", "s1", "r1");

        let persisted = recorder
            .record_completion(
                &scope,
                EntityType::Company,
                "c1",
                "l1",
                CompletionStatus::Completed,
                0.0,
                None,
            )
            .await;
        assert!(!persisted);
    }
}
