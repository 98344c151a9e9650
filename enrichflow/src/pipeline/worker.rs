//! The reactive stage worker.
//!
//! A worker owns one StageRun. It polls the eligibility engine, hands each
//! newly eligible entity to the stage handler one at a time, and finishes
//! once its predecessors are terminal and nothing new becomes eligible.
//!
//! ```text
//! pending -> running -> { stopped | completed | failed }
//! ```

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::WorkerServices;
use crate::core::{
    CompletionStatus, CurrentItem, EntityType, ItemStatus, RecentItem, RunScope, RunStatus,
    StageProgress,
};
use crate::eligibility::EligibilityFilter;
use crate::errors::{EnrichflowError, StoreError};
use crate::events;
use crate::handlers::{HandlerContext, StageHandler};
use crate::utils::now_utc;

/// Static description of the work one worker performs.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// The StageRun the worker owns.
    pub stage_run_id: String,
    /// Stage code.
    pub stage: String,
    /// Entity type processed by the stage.
    pub entity_type: EntityType,
    /// Gate stages count rejections as decisions.
    pub is_gate: bool,
    /// Tenant, scope and run.
    pub scope: RunScope,
    /// Eligibility filters for the run.
    pub filter: EligibilityFilter,
    /// Per-stage cap on dispatched entities.
    pub sample_size: Option<usize>,
    /// Opaque context forwarded to the handler.
    pub handler_context: Option<Value>,
    /// StageRun ids this worker waits for before finishing.
    pub predecessors: Vec<String>,
}

#[derive(Debug, Default)]
struct WorkerState {
    dispatched: HashSet<String>,
    progress: StageProgress,
}

enum Outcome {
    Stopped,
    Drained,
}

/// Drives one StageRun to a terminal status.
#[derive(Debug)]
pub struct StageWorker {
    spec: WorkerSpec,
    handler: Arc<dyn StageHandler>,
    services: WorkerServices,
}

impl StageWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(spec: WorkerSpec, handler: Arc<dyn StageHandler>, services: WorkerServices) -> Self {
        Self {
            spec,
            handler,
            services,
        }
    }

    /// Runs the worker to completion and returns the final StageRun status.
    ///
    /// # Errors
    ///
    /// Returns an error only when the StageRun itself cannot be read or
    /// transitioned. Per-entity failures are recorded, never returned.
    pub async fn run(self) -> Result<RunStatus, EnrichflowError> {
        let span = info_span!(
            "stage_worker",
            stage = %self.spec.stage,
            pipeline_run_id = %self.spec.scope.pipeline_run_id,
            stage_run_id = %self.spec.stage_run_id,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<RunStatus, EnrichflowError> {
        let store = &self.services.store;
        let id = self.spec.stage_run_id.as_str();

        if !store
            .transition_stage_run(id, &[RunStatus::Pending], RunStatus::Running, None)
            .await?
        {
            let current = store
                .get_stage_run(id)
                .await?
                .ok_or_else(|| StoreError::not_found("stage run", id))?;
            return match current.status {
                RunStatus::Stopping => self.finish_stopped(&StageProgress::default()).await,
                status if status.is_terminal() => Ok(status),
                status => Err(EnrichflowError::InvalidRequest(format!(
                    "stage run {id} is already {status}"
                ))),
            };
        }

        info!("Stage started");
        self.emit(events::STAGE_STARTED, None).await;

        let skipped = self
            .services
            .engine
            .auto_skip_country_gated(&self.spec.stage, &self.spec.scope)
            .await;
        if skipped > 0 {
            self.emit(events::STAGE_AUTO_SKIPPED, Some(json!({ "skipped": skipped }))).await;
        }

        let mut state = WorkerState::default();
        match self.poll_loop(&mut state).await {
            Outcome::Stopped => self.finish_stopped(&state.progress).await,
            Outcome::Drained => self.finish_drained(&state.progress).await,
        }
    }

    async fn poll_loop(&self, state: &mut WorkerState) -> Outcome {
        let mut upstream_settled = false;

        loop {
            if self.stop_requested().await {
                return Outcome::Stopped;
            }
            if self.cap_remaining(state) == Some(0) {
                debug!(dispatched = state.dispatched.len(), "Sample cap reached");
                return Outcome::Drained;
            }

            let eligible = match self
                .services
                .engine
                .get_eligible_ids(&self.spec.stage, &self.spec.scope, &self.spec.filter, None)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "Eligibility query failed, backing off");
                    tokio::time::sleep(self.services.config.poll_interval()).await;
                    continue;
                }
            };

            let mut batch: Vec<String> = eligible
                .into_iter()
                .filter(|id| !state.dispatched.contains(id))
                .collect();
            if let Some(remaining) = self.cap_remaining(state) {
                batch.truncate(remaining);
            }

            if !batch.is_empty() {
                upstream_settled = false;
                state.progress.total = (state.dispatched.len() + batch.len()) as u64;
                for entity_id in batch {
                    if self.stop_requested().await {
                        return Outcome::Stopped;
                    }
                    self.process(state, entity_id).await;
                }
                continue;
            }

            if self.predecessors_terminal().await {
                if upstream_settled {
                    return Outcome::Drained;
                }
                // Upstream may have written its last records just before
                // turning terminal.
                upstream_settled = true;
                continue;
            }

            // Heartbeat: an idle worker still refreshes `updated_at`.
            self.save_progress(&state.progress).await;
            tokio::time::sleep(self.services.config.poll_interval()).await;
        }
    }

    fn cap_remaining(&self, state: &WorkerState) -> Option<usize> {
        self.spec
            .sample_size
            .map(|cap| cap.saturating_sub(state.dispatched.len()))
    }

    async fn process(&self, state: &mut WorkerState, entity_id: String) {
        let name = match self.services.store.get_entity(&entity_id).await {
            Ok(Some(entity)) => entity.name,
            Ok(None) => entity_id.clone(),
            Err(e) => {
                debug!(entity_id = %entity_id, error = %e, "Entity lookup failed");
                entity_id.clone()
            }
        };

        state.dispatched.insert(entity_id.clone());
        state.progress.current_item = Some(CurrentItem {
            entity_id: entity_id.clone(),
            name: name.clone(),
            status: ItemStatus::Processing,
        });
        self.save_progress(&state.progress).await;

        let ctx = HandlerContext {
            entity_id: entity_id.clone(),
            stage: self.spec.stage.clone(),
            entity_type: self.spec.entity_type,
            scope: self.spec.scope.clone(),
            context: self.spec.handler_context.clone(),
        };
        let mut retryable = false;
        let mut handler_data = None;
        let (item_status, cost, error) = match self.handler.handle(&ctx).await {
            Ok(output) => {
                if let Some(data) = &output.data {
                    debug!(entity_id = %entity_id, data = %data, "Handler data");
                }
                handler_data = output.data;
                match output.rejection {
                    Some(reason) => (ItemStatus::Rejected, output.cost, Some(reason)),
                    None => (ItemStatus::Completed, output.cost, None),
                }
            }
            Err(e) => {
                retryable = e.retryable;
                (ItemStatus::Failed, 0.0, Some(e.to_string()))
            }
        };

        let record_status = if item_status == ItemStatus::Completed {
            CompletionStatus::Completed
        } else {
            CompletionStatus::Failed
        };
        self.services
            .recorder
            .record_completion(
                &self.spec.scope,
                self.spec.entity_type,
                &entity_id,
                &self.spec.stage,
                record_status,
                cost,
                error.as_deref(),
            )
            .await;

        let counts_as_done = match item_status {
            ItemStatus::Completed => true,
            ItemStatus::Rejected => self.spec.is_gate,
            ItemStatus::Failed | ItemStatus::Processing => false,
        };
        let progress = &mut state.progress;
        if counts_as_done {
            progress.done += 1;
        } else {
            progress.failed += 1;
        }
        progress.cost += cost;
        progress.current_item = Some(CurrentItem {
            entity_id: entity_id.clone(),
            name: name.clone(),
            status: item_status,
        });
        progress.push_recent(
            RecentItem {
                entity_id: entity_id.clone(),
                name,
                status: item_status,
                cost,
                error: error.clone(),
                at: now_utc(),
            },
            self.services.config.recent_items_limit,
        );
        self.save_progress(progress).await;

        let (event, data) = if item_status == ItemStatus::Completed {
            (
                events::STAGE_ITEM_COMPLETED,
                json!({ "entity_id": entity_id, "cost": cost, "data": handler_data }),
            )
        } else {
            debug!(entity_id = %entity_id, error = ?error, retryable, "Item not completed");
            (
                events::STAGE_ITEM_FAILED,
                json!({
                    "entity_id": entity_id,
                    "cost": cost,
                    "error": error,
                    "retryable": retryable,
                    "data": handler_data,
                }),
            )
        };
        self.services
            .events
            .try_emit(event, Some(self.event_data(data)));
    }

    async fn save_progress(&self, progress: &StageProgress) {
        if let Err(e) = self
            .services
            .store
            .update_stage_progress(&self.spec.stage_run_id, progress)
            .await
        {
            warn!(error = %e, "Failed to persist stage progress");
        }
    }

    async fn stop_requested(&self) -> bool {
        match self.services.store.get_stage_run(&self.spec.stage_run_id).await {
            Ok(Some(run)) => run.status == RunStatus::Stopping,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Failed to read stop flag");
                false
            }
        }
    }

    async fn predecessors_terminal(&self) -> bool {
        for predecessor in &self.spec.predecessors {
            match self.services.store.get_stage_run(predecessor).await {
                Ok(Some(run)) if run.status.is_terminal() => {}
                Ok(Some(_)) => return false,
                Ok(None) => {
                    warn!(predecessor = %predecessor, "Predecessor stage run missing");
                }
                Err(e) => {
                    warn!(predecessor = %predecessor, error = %e, "Failed to read predecessor");
                    return false;
                }
            }
        }
        true
    }

    async fn finish_drained(&self, progress: &StageProgress) -> Result<RunStatus, EnrichflowError> {
        let status = if progress.done > 0 || progress.failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let error = (status == RunStatus::Failed)
            .then(|| format!("all {} attempted entities failed", progress.failed));

        self.save_progress(progress).await;
        let applied = self
            .services
            .store
            .transition_stage_run(
                &self.spec.stage_run_id,
                &[RunStatus::Running],
                status,
                error.as_deref(),
            )
            .await?;
        if !applied {
            // A stop flag landed after the last check.
            return self.finish_stopped(progress).await;
        }

        info!(
            status = %status,
            done = progress.done,
            failed = progress.failed,
            cost = progress.cost,
            "Stage finished"
        );
        let event = if status == RunStatus::Completed {
            events::STAGE_COMPLETED
        } else {
            events::STAGE_FAILED
        };
        self.emit(event, Some(progress_data(progress))).await;
        Ok(status)
    }

    async fn finish_stopped(&self, progress: &StageProgress) -> Result<RunStatus, EnrichflowError> {
        let store = &self.services.store;
        let id = self.spec.stage_run_id.as_str();
        let applied = store
            .transition_stage_run(
                id,
                &[RunStatus::Running, RunStatus::Stopping],
                RunStatus::Stopped,
                None,
            )
            .await?;
        if !applied {
            let current = store
                .get_stage_run(id)
                .await?
                .ok_or_else(|| StoreError::not_found("stage run", id))?;
            return Ok(current.status);
        }

        info!(done = progress.done, failed = progress.failed, "Stage stopped");
        self.emit(events::STAGE_STOPPED, Some(progress_data(progress))).await;
        Ok(RunStatus::Stopped)
    }

    async fn emit(&self, event_type: &str, data: Option<Value>) {
        let data = self.event_data(data.unwrap_or_else(|| json!({})));
        self.services.events.emit(event_type, Some(data)).await;
    }

    fn event_data(&self, mut data: Value) -> Value {
        if let Value::Object(map) = &mut data {
            map.insert("stage".into(), json!(self.spec.stage));
            map.insert("stage_run_id".into(), json!(self.spec.stage_run_id));
            map.insert(
                "pipeline_run_id".into(),
                json!(self.spec.scope.pipeline_run_id),
            );
        }
        data
    }
}

fn progress_data(progress: &StageProgress) -> Value {
    json!({
        "done": progress.done,
        "failed": progress.failed,
        "total": progress.total,
        "cost": progress.cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Entity, StageRun};
    use crate::errors::HandlerError;
    use crate::events::CollectingEventSink;
    use crate::handlers::{FnHandler, HandlerOutput};
    use crate::store::{InMemoryStore, PipelineStore};
    use crate::testing::{FailingHandler, FailingStore, MockHandler};
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        events: Arc<CollectingEventSink>,
        services: WorkerServices,
    }

    async fn harness(companies: usize) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..companies {
            store
                .upsert_entity(&Entity::company(
                    format!("c{i}"),
                    "t1",
                    "s1",
                    format!("Company {i}"),
                ))
                .await
                .unwrap();
        }
        let events = Arc::new(CollectingEventSink::new());
        let config =
            crate::config::EngineConfig::new().with_poll_interval(Duration::from_millis(100));
        let services = WorkerServices::new(
            crate::registry::StageRegistry::builtin(),
            store.clone(),
            events.clone(),
            config,
        );
        Harness {
            store,
            events,
            services,
        }
    }

    fn spec(stage_run_id: &str, stage: &str) -> WorkerSpec {
        WorkerSpec {
            stage_run_id: stage_run_id.to_string(),
            stage: stage.to_string(),
            entity_type: EntityType::Company,
            is_gate: stage == "triage",
            scope: RunScope::new("t1", "s1", "r1"),
            filter: EligibilityFilter::default(),
            sample_size: None,
            handler_context: None,
            predecessors: Vec::new(),
        }
    }

    async fn stage_run(store: &InMemoryStore, id: &str, stage: &str) {
        store
            .insert_stage_run(&StageRun::pending(id, "r1", stage))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_stage_drains_and_completes() {
        let h = harness(3).await;
        stage_run(&h.store, "sr1", "l1").await;
        let handler = Arc::new(MockHandler::new().with_cost(0.5));

        let status = StageWorker::new(spec("sr1", "l1"), handler.clone(), h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(handler.call_count(), 3);
        let run = h.store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(run.progress.done, 3);
        assert_eq!(run.progress.total, 3);
        assert!((run.progress.cost - 1.5).abs() < f64::EPSILON);
        assert_eq!(run.progress.recent_items[0].entity_id, "c2");
        assert_eq!(h.events.count_of(events::STAGE_ITEM_COMPLETED), 3);
        assert_eq!(h.events.count_of(events::STAGE_COMPLETED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failures_fail_the_stage() {
        let h = harness(2).await;
        stage_run(&h.store, "sr1", "l1").await;

        let handler = Arc::new(FailingHandler::new("boom"));
        let status = StageWorker::new(spec("sr1", "l1"), handler, h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Failed);
        let run = h.store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(run.progress.failed, 2);
        assert!(run.error.is_some());
        assert_eq!(h.store.completion_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_events_carry_handler_data_and_retry_hint() {
        let h = harness(2).await;
        stage_run(&h.store, "sr1", "l1").await;
        let handler = FnHandler::new("l1", |ctx: &HandlerContext| {
            if ctx.entity_id == "c0" {
                Ok(HandlerOutput::ok().with_data(json!({ "source": "registry" })))
            } else {
                Err(HandlerError::retryable("upstream timeout"))
            }
        });

        StageWorker::new(spec("sr1", "l1"), Arc::new(handler), h.services.clone())
            .run()
            .await
            .unwrap();

        let completed = h.events.events_of_type(events::STAGE_ITEM_COMPLETED);
        let data = completed[0].1.as_ref().unwrap();
        assert_eq!(data["entity_id"], "c0");
        assert_eq!(data["data"]["source"], "registry");

        let failed = h.events.events_of_type(events::STAGE_ITEM_FAILED);
        let data = failed[0].1.as_ref().unwrap();
        assert_eq!(data["entity_id"], "c1");
        assert_eq!(data["retryable"], true);
        assert_eq!(data["error"], "upstream timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_eligible_completes_with_nothing_done() {
        let h = harness(0).await;
        stage_run(&h.store, "sr1", "l1").await;

        let handler = Arc::new(MockHandler::new());
        let status = StageWorker::new(spec("sr1", "l1"), handler, h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        let run = h.store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(run.progress.done, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_cap_limits_dispatch() {
        let h = harness(5).await;
        stage_run(&h.store, "sr1", "l1").await;
        let handler = Arc::new(MockHandler::new());
        let mut spec = spec("sr1", "l1");
        spec.sample_size = Some(2);

        let status = StageWorker::new(spec, handler.clone(), h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(handler.call_count(), 2);
        let run = h.store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(run.progress.total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_before_start_finishes_stopped() {
        let h = harness(2).await;
        let mut run = StageRun::pending("sr1", "r1", "l1");
        run.status = RunStatus::Stopping;
        h.store.insert_stage_run(&run).await.unwrap();
        let handler = Arc::new(MockHandler::new());

        let status = StageWorker::new(spec("sr1", "l1"), handler.clone(), h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Stopped);
        assert_eq!(handler.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_rejection_counts_as_done_on_gate_stage() {
        let h = harness(2).await;
        for i in 0..2 {
            h.store
                .upsert_completion(&crate::core::CompletionRecord::new(
                    &RunScope::new("t1", "s1", "r1"),
                    EntityType::Company,
                    format!("c{i}"),
                    "l1",
                    CompletionStatus::Completed,
                ))
                .await
                .unwrap();
        }
        stage_run(&h.store, "sr1", "triage").await;
        let handler = Arc::new(MockHandler::new().rejecting("c1", "not a fit"));

        let status = StageWorker::new(spec("sr1", "triage"), handler, h.services.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        let run = h.store.get_stage_run("sr1").await.unwrap().unwrap();
        assert_eq!(run.progress.done, 2);
        assert_eq!(run.progress.failed, 0);
        let rejected = h
            .store
            .get_completion(&crate::core::CompletionKey::new("r1", "c1", "triage"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.status, CompletionStatus::Failed);
        assert_eq!(rejected.error.as_deref(), Some("not a fit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_running_predecessor() {
        let h = harness(1).await;
        let mut upstream = StageRun::pending("sr-up", "r1", "l1");
        upstream.status = RunStatus::Running;
        h.store.insert_stage_run(&upstream).await.unwrap();
        stage_run(&h.store, "sr-down", "triage").await;

        let mut downstream = spec("sr-down", "triage");
        downstream.predecessors = vec!["sr-up".to_string()];
        let handler = Arc::new(MockHandler::new());
        let worker = StageWorker::new(downstream, handler.clone(), h.services.clone());
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!task.is_finished());
        assert_eq!(handler.call_count(), 0);

        h.store
            .upsert_completion(&crate::core::CompletionRecord::new(
                &RunScope::new("t1", "s1", "r1"),
                EntityType::Company,
                "c0",
                "l1",
                CompletionStatus::Completed,
            ))
            .await
            .unwrap();
        h.store
            .transition_stage_run("sr-up", &[RunStatus::Running], RunStatus::Completed, None)
            .await
            .unwrap();

        let status = task.await.unwrap().unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_completion_writes_do_not_redispatch() {
        let store = Arc::new(FailingStore::new());
        for i in 0..2 {
            store
                .upsert_entity(&Entity::company(
                    format!("c{i}"),
                    "t1",
                    "s1",
                    format!("Company {i}"),
                ))
                .await
                .unwrap();
        }
        store
            .insert_stage_run(&StageRun::pending("sr1", "r1", "l1"))
            .await
            .unwrap();
        let services = WorkerServices::new(
            crate::registry::StageRegistry::builtin(),
            store.clone(),
            Arc::new(CollectingEventSink::new()),
            crate::config::EngineConfig::new().with_poll_interval(Duration::from_millis(100)),
        );
        let handler = Arc::new(MockHandler::new());

        let status = StageWorker::new(spec("sr1", "l1"), handler.clone(), services)
            .run()
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(handler.call_count(), 2);
        assert_eq!(store.inner().completion_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eligibility_errors_back_off_and_retry() {
        let store = Arc::new(FailingStore::new());
        store.set_fail_completions(false);
        store.set_fail_selects(true);
        store
            .upsert_entity(&Entity::company("c0", "t1", "s1", "Company 0"))
            .await
            .unwrap();
        store
            .insert_stage_run(&StageRun::pending("sr1", "r1", "l1"))
            .await
            .unwrap();
        let services = WorkerServices::new(
            crate::registry::StageRegistry::builtin(),
            store.clone(),
            Arc::new(CollectingEventSink::new()),
            crate::config::EngineConfig::new().with_poll_interval(Duration::from_millis(100)),
        );
        let handler = Arc::new(MockHandler::new());
        let worker = StageWorker::new(spec("sr1", "l1"), handler.clone(), services);
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!task.is_finished());
        store.set_fail_selects(false);

        assert_eq!(task.await.unwrap().unwrap(), RunStatus::Completed);
        assert_eq!(handler.calls(), vec!["c0"]);
    }
}
