//! Pipeline runs: start, supervise, stop and report.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::worker::{StageWorker, WorkerSpec};
use super::WorkerServices;
use crate::config::EngineConfig;
use crate::core::{
    PipelineRun, PipelineStatusView, RunFilters, RunScope, RunStatus, StageRun, StageRunView,
};
use crate::eligibility::EligibilityFilter;
use crate::errors::{EnrichflowError, RegistryError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::handlers::HandlerRegistry;
use crate::registry::StageRegistry;
use crate::store::PipelineStore;
use crate::utils::{generate_id, now_utc};

/// A request to run a subset of stages over a tenant scope.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Entity scope.
    pub scope_id: String,
    /// Stage codes to run, in any order.
    pub stages: Vec<String>,
    /// Selection filters.
    pub filters: RunFilters,
}

impl StartRequest {
    /// Creates a request without filters.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        stages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope_id: scope_id.into(),
            stages: stages.into_iter().map(Into::into).collect(),
            filters: RunFilters::default(),
        }
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: RunFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Handle to a running pipeline's coordinator task.
#[derive(Debug)]
pub struct PipelineHandle {
    join: JoinHandle<Result<RunStatus, EnrichflowError>>,
}

impl PipelineHandle {
    /// Waits for the run to reach its final status.
    ///
    /// # Errors
    ///
    /// Returns the coordinator's error, or [`EnrichflowError::TaskFailed`]
    /// if the task panicked.
    pub async fn wait(self) -> Result<RunStatus, EnrichflowError> {
        self.join
            .await
            .map_err(|e| EnrichflowError::TaskFailed(e.to_string()))?
    }

    /// Returns true once the coordinator task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// What [`PipelineCoordinator::start`] returns.
#[derive(Debug)]
pub struct StartedPipeline {
    /// The new pipeline run id.
    pub pipeline_run_id: String,
    /// Stage code to StageRun id.
    pub stage_run_ids: BTreeMap<String, String>,
    /// Topological order of the selected stages.
    pub stage_order: Vec<String>,
    /// Coordinator task handle.
    pub handle: PipelineHandle,
}

struct WorkerSlot {
    stage_run_id: String,
    stage: String,
    join: Option<JoinHandle<Result<RunStatus, EnrichflowError>>>,
}

/// What the supervisor does after one tick.
enum Tick {
    Finished(RunStatus),
    Recheck,
    Wait,
}

/// Starts pipeline runs and supervises their workers.
#[derive(Debug, Clone)]
pub struct PipelineCoordinator {
    registry: Arc<StageRegistry>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn PipelineStore>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl PipelineCoordinator {
    /// Creates a coordinator with default config and no event sink.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        handlers: HandlerRegistry,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        Self {
            registry,
            handlers: Arc::new(handlers),
            store,
            events: Arc::new(NoOpEventSink),
            config: EngineConfig::default(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the engine config.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    /// Validates the request, persists the run and spawns one worker per
    /// stage plus the supervising coordinator task.
    ///
    /// Nothing is written or spawned when validation fails.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::InvalidRequest`] for an empty selection,
    /// registry errors for unknown stages or cycles,
    /// [`EnrichflowError::UnknownHandler`] for stages without a handler, and
    /// store errors from persisting the run.
    pub async fn start(&self, request: StartRequest) -> Result<StartedPipeline, EnrichflowError> {
        if request.stages.is_empty() {
            return Err(EnrichflowError::InvalidRequest("no stages selected".into()));
        }
        self.config.validate()?;

        let soft = &request.filters.soft_deps;
        let stage_order = self.registry.topo_sort(&request.stages, soft)?;
        let mut handlers = Vec::with_capacity(stage_order.len());
        for stage in &stage_order {
            handlers.push(self.handlers.get(stage)?);
        }

        let pipeline_run_id = generate_id();
        let stage_run_ids: BTreeMap<String, String> = stage_order
            .iter()
            .map(|stage| (stage.clone(), generate_id()))
            .collect();
        let now = now_utc();
        let run = PipelineRun {
            id: pipeline_run_id.clone(),
            tenant_id: request.tenant_id.clone(),
            scope_id: request.scope_id.clone(),
            status: RunStatus::Running,
            cost: 0.0,
            stage_runs: stage_run_ids.clone(),
            stage_order: stage_order.clone(),
            filters: request.filters.clone(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let mut specs = Vec::with_capacity(stage_order.len());
        for stage in &stage_order {
            let descriptor = self.registry.get(stage).map_err(RegistryError::from)?;
            let predecessors = self
                .registry
                .selected_predecessors(stage, &stage_order, soft)
                .map_err(RegistryError::from)?
                .iter()
                .filter_map(|code| stage_run_ids.get(code).cloned())
                .collect();
            specs.push(WorkerSpec {
                stage_run_id: stage_run_ids[stage].clone(),
                stage: stage.clone(),
                entity_type: descriptor.entity_type,
                is_gate: descriptor.is_gate,
                scope: RunScope::new(&request.tenant_id, &request.scope_id, &pipeline_run_id),
                filter: EligibilityFilter::from(&request.filters),
                sample_size: request.filters.sample_size,
                handler_context: request.filters.handler_context.clone(),
                predecessors,
            });
        }

        self.store.insert_pipeline_run(&run).await?;
        for spec in &specs {
            self.store
                .insert_stage_run(&StageRun::pending(
                    &spec.stage_run_id,
                    &pipeline_run_id,
                    &spec.stage,
                ))
                .await?;
        }

        info!(
            pipeline_run_id = %pipeline_run_id,
            tenant_id = %request.tenant_id,
            scope_id = %request.scope_id,
            stages = ?stage_order,
            "Pipeline started"
        );
        self.events
            .emit(
                events::PIPELINE_STARTED,
                Some(json!({
                    "pipeline_run_id": pipeline_run_id,
                    "stage_order": stage_order,
                })),
            )
            .await;

        let services = WorkerServices::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            self.config.clone(),
        );
        let slots = specs
            .into_iter()
            .zip(handlers)
            .map(|(spec, handler)| WorkerSlot {
                stage_run_id: spec.stage_run_id.clone(),
                stage: spec.stage.clone(),
                join: Some(tokio::spawn(
                    StageWorker::new(spec, handler, services.clone()).run(),
                )),
            })
            .collect();

        let span = info_span!("pipeline_coordinator", pipeline_run_id = %pipeline_run_id);
        let join = tokio::spawn(
            self.clone()
                .supervise(pipeline_run_id.clone(), slots)
                .instrument(span),
        );

        Ok(StartedPipeline {
            pipeline_run_id,
            stage_run_ids,
            stage_order,
            handle: PipelineHandle { join },
        })
    }

    /// Requests a cooperative stop of a run.
    ///
    /// Flags the run and its non-terminal stage runs `stopping`. Returns
    /// false if the run had already finished.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::PipelineNotFound`] for unknown runs.
    pub async fn stop(&self, pipeline_run_id: &str) -> Result<bool, EnrichflowError> {
        let run = self
            .store
            .get_pipeline_run(pipeline_run_id)
            .await?
            .ok_or_else(|| EnrichflowError::PipelineNotFound(pipeline_run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(false);
        }

        let flagged = self
            .store
            .transition_pipeline_run(
                pipeline_run_id,
                &[RunStatus::Pending, RunStatus::Running],
                RunStatus::Stopping,
            )
            .await?;
        if flagged {
            info!(pipeline_run_id, "Pipeline stop requested");
            self.events
                .emit(
                    events::PIPELINE_STOPPING,
                    Some(json!({ "pipeline_run_id": pipeline_run_id })),
                )
                .await;
        }
        self.cascade_stop(pipeline_run_id).await?;
        Ok(true)
    }

    /// Returns the latest run of a tenant scope with per-stage views.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn status(
        &self,
        tenant_id: &str,
        scope_id: &str,
    ) -> Result<Option<PipelineStatusView>, EnrichflowError> {
        match self.store.latest_pipeline_run(tenant_id, scope_id).await? {
            Some(run) => Ok(Some(self.view(run).await?)),
            None => Ok(None),
        }
    }

    /// Returns the status view of one run.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichflowError::PipelineNotFound`] for unknown runs.
    pub async fn pipeline_status(
        &self,
        pipeline_run_id: &str,
    ) -> Result<PipelineStatusView, EnrichflowError> {
        let run = self
            .store
            .get_pipeline_run(pipeline_run_id)
            .await?
            .ok_or_else(|| EnrichflowError::PipelineNotFound(pipeline_run_id.to_string()))?;
        self.view(run).await
    }

    async fn view(&self, run: PipelineRun) -> Result<PipelineStatusView, EnrichflowError> {
        let stage_runs = self.store.list_stage_runs(&run.id).await?;
        let now = Utc::now();
        let stale_after = self.config.stale_after();
        let mut stages: Vec<StageRunView> = Vec::with_capacity(stage_runs.len());
        for stage in &run.stage_order {
            if let Some(stage_run) = stage_runs.iter().find(|sr| &sr.stage == stage) {
                stages.push(StageRunView::from_stage_run(stage_run, now, stale_after));
            }
        }

        Ok(PipelineStatusView {
            pipeline_run_id: run.id,
            status: run.status,
            cost: run.cost,
            stage_order: run.stage_order,
            stages,
            created_at: run.created_at,
            finished_at: run.finished_at,
        })
    }

    async fn cascade_stop(&self, pipeline_run_id: &str) -> Result<(), EnrichflowError> {
        for stage_run in self.store.list_stage_runs(pipeline_run_id).await? {
            if self
                .store
                .transition_stage_run(
                    &stage_run.id,
                    &[RunStatus::Pending, RunStatus::Running],
                    RunStatus::Stopping,
                    None,
                )
                .await?
            {
                info!(stage = %stage_run.stage, "Stage flagged stopping");
            }
        }
        Ok(())
    }

    async fn supervise(
        self,
        pipeline_run_id: String,
        mut slots: Vec<WorkerSlot>,
    ) -> Result<RunStatus, EnrichflowError> {
        loop {
            match self.tick(&pipeline_run_id, &mut slots).await {
                Ok(Tick::Finished(status)) => return Ok(status),
                Ok(Tick::Recheck) => continue,
                Ok(Tick::Wait) => {}
                Err(e @ EnrichflowError::PipelineNotFound(_)) => return Err(e),
                Err(e) => warn!(error = %e, "Coordinator tick failed, retrying"),
            }
            tokio::time::sleep(self.config.coordinator_interval()).await;
        }
    }

    async fn tick(
        &self,
        pipeline_run_id: &str,
        slots: &mut [WorkerSlot],
    ) -> Result<Tick, EnrichflowError> {
        let run = self
            .store
            .get_pipeline_run(pipeline_run_id)
            .await?
            .ok_or_else(|| EnrichflowError::PipelineNotFound(pipeline_run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(Tick::Finished(run.status));
        }

        if run.status == RunStatus::Stopping {
            self.cascade_stop(pipeline_run_id).await?;
        }
        self.reap_workers(slots).await?;

        let stage_runs = self.store.list_stage_runs(pipeline_run_id).await?;
        let cost: f64 = stage_runs.iter().map(|sr| sr.progress.cost).sum();
        if let Err(e) = self.store.set_pipeline_run_cost(pipeline_run_id, cost).await {
            warn!(error = %e, "Failed to update pipeline cost");
        }

        if !stage_runs.iter().all(|sr| sr.status.is_terminal()) {
            // No worker is left to finish these.
            if slots.iter().all(|slot| slot.join.is_none())
                && self.fail_abandoned(&stage_runs).await? > 0
            {
                return Ok(Tick::Recheck);
            }
            return Ok(Tick::Wait);
        }

        let final_status = if run.status == RunStatus::Stopping {
            RunStatus::Stopped
        } else if stage_runs.iter().any(|sr| sr.status == RunStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if !self
            .store
            .transition_pipeline_run(pipeline_run_id, &[run.status], final_status)
            .await?
        {
            // The run changed status under us (a stop request).
            return Ok(Tick::Recheck);
        }

        info!(status = %final_status, cost, "Pipeline finished");
        let event = match final_status {
            RunStatus::Stopped => events::PIPELINE_STOPPED,
            RunStatus::Failed => events::PIPELINE_FAILED,
            _ => events::PIPELINE_COMPLETED,
        };
        self.events
            .emit(
                event,
                Some(json!({ "pipeline_run_id": pipeline_run_id, "cost": cost })),
            )
            .await;
        Ok(Tick::Finished(final_status))
    }

    /// Fails every non-terminal StageRun. Returns how many were marked.
    async fn fail_abandoned(&self, stage_runs: &[StageRun]) -> Result<usize, EnrichflowError> {
        let mut marked = 0;
        for stage_run in stage_runs.iter().filter(|sr| !sr.status.is_terminal()) {
            if self
                .store
                .transition_stage_run(
                    &stage_run.id,
                    &RunStatus::ACTIVE,
                    RunStatus::Failed,
                    Some("worker exited without finishing"),
                )
                .await?
            {
                warn!(stage = %stage_run.stage, "Marked abandoned stage run failed");
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Joins exited workers and fails any StageRun a worker left non-terminal.
    async fn reap_workers(&self, slots: &mut [WorkerSlot]) -> Result<(), EnrichflowError> {
        for slot in slots.iter_mut() {
            if !slot.join.as_ref().is_some_and(JoinHandle::is_finished) {
                continue;
            }
            let Some(join) = slot.join.take() else {
                continue;
            };
            let reason = match join.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(format!("worker exited with error: {e}")),
                Err(e) => Some(format!("worker crashed: {e}")),
            };
            if let Some(reason) = &reason {
                error!(stage = %slot.stage, reason = %reason, "Stage worker failed");
            }

            let marked = self
                .store
                .transition_stage_run(
                    &slot.stage_run_id,
                    &RunStatus::ACTIVE,
                    RunStatus::Failed,
                    Some(
                        reason
                            .as_deref()
                            .unwrap_or("worker exited without finishing"),
                    ),
                )
                .await?;
            if marked {
                warn!(stage = %slot.stage, "Marked abandoned stage run failed");
            }
        }
        Ok(())
    }
}
