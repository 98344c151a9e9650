//! Mock handlers and stores for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{
    CompletionKey, CompletionRecord, Entity, PipelineRun, RunStatus, StageProgress, StageRun,
};
use crate::eligibility::EligibilityQuery;
use crate::errors::{HandlerError, StoreError};
use crate::handlers::{HandlerContext, HandlerOutput, StageHandler};
use crate::store::{InMemoryStore, PipelineStore};

/// A handler that records calls and returns configurable outcomes per entity.
#[derive(Debug, Default)]
pub struct MockHandler {
    cost: f64,
    rejections: HashMap<String, String>,
    failures: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl MockHandler {
    /// Creates a handler that succeeds at zero cost.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cost reported for each successful or rejected entity.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Rejects `entity_id` with `reason`.
    #[must_use]
    pub fn rejecting(mut self, entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rejections.insert(entity_id.into(), reason.into());
        self
    }

    /// Fails `entity_id` with a handler error.
    #[must_use]
    pub fn failing_for(mut self, entity_id: impl Into<String>) -> Self {
        self.failures.insert(entity_id.into());
        self
    }

    /// Sleeps for `delay` before every outcome.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the entity ids in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StageHandler for MockHandler {
    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        self.calls.lock().push(ctx.entity_id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.contains(&ctx.entity_id) {
            return Err(HandlerError::new(format!("mock failure for {}", ctx.entity_id)));
        }
        let output = match self.rejections.get(&ctx.entity_id) {
            Some(reason) => HandlerOutput::rejected(reason.clone()),
            None => HandlerOutput::ok(),
        };
        Ok(output.with_cost(self.cost))
    }
}

/// A handler that always fails.
#[derive(Debug)]
pub struct FailingHandler {
    error: String,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Creates a handler failing with `error`.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for FailingHandler {
    async fn handle(&self, _ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::new(self.error.clone()))
    }
}

/// A handler that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowHandler {
    /// Creates a handler taking `delay` per entity.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a slow handler with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Returns the number of calls started.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for SlowHandler {
    async fn handle(&self, _ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(HandlerOutput::ok())
    }
}

/// A handler that panics, taking its worker task down with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingHandler;

#[async_trait]
impl StageHandler for PanickingHandler {
    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        panic!("handler panicked on {}", ctx.entity_id);
    }
}

/// An [`InMemoryStore`] whose completion writes fail.
///
/// Eligibility selects, stage run listings and stage run transitions can be
/// made to fail as well.
#[derive(Debug)]
pub struct FailingStore {
    inner: InMemoryStore,
    fail_completions: AtomicBool,
    fail_selects: AtomicBool,
    fail_stage_run_lists: AtomicBool,
    fail_stage_transitions: AtomicBool,
    injected: AtomicUsize,
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingStore {
    /// Creates a store rejecting every completion upsert.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_completions: AtomicBool::new(true),
            fail_selects: AtomicBool::new(false),
            fail_stage_run_lists: AtomicBool::new(false),
            fail_stage_transitions: AtomicBool::new(false),
            injected: AtomicUsize::new(0),
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Toggles completion upsert failures.
    pub fn set_fail_completions(&self, fail: bool) {
        self.fail_completions.store(fail, Ordering::SeqCst);
    }

    /// Toggles eligibility select failures.
    pub fn set_fail_selects(&self, fail: bool) {
        self.fail_selects.store(fail, Ordering::SeqCst);
    }

    /// Toggles stage run listing failures.
    pub fn set_fail_stage_run_lists(&self, fail: bool) {
        self.fail_stage_run_lists.store(fail, Ordering::SeqCst);
    }

    /// Toggles stage run transition failures.
    pub fn set_fail_stage_transitions(&self, fail: bool) {
        self.fail_stage_transitions.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of failures returned so far.
    #[must_use]
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Backend(format!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for FailingStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.inner.upsert_entity(entity).await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        self.inner.get_entity(id).await
    }

    async fn upsert_completion(&self, record: &CompletionRecord) -> Result<(), StoreError> {
        self.check(&self.fail_completions, "completion upsert")?;
        self.inner.upsert_completion(record).await
    }

    async fn get_completion(
        &self,
        key: &CompletionKey,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        self.inner.get_completion(key).await
    }

    async fn list_completions(
        &self,
        pipeline_run_id: &str,
    ) -> Result<Vec<CompletionRecord>, StoreError> {
        self.inner.list_completions(pipeline_run_id).await
    }

    async fn select_entity_ids(
        &self,
        query: &EligibilityQuery,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        self.check(&self.fail_selects, "select")?;
        self.inner.select_entity_ids(query, limit).await
    }

    async fn count_entities(&self, query: &EligibilityQuery) -> Result<u64, StoreError> {
        self.check(&self.fail_selects, "count")?;
        self.inner.count_entities(query).await
    }

    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.inner.insert_pipeline_run(run).await
    }

    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError> {
        self.inner.get_pipeline_run(id).await
    }

    async fn latest_pipeline_run(
        &self,
        tenant_id: &str,
        scope_id: &str,
    ) -> Result<Option<PipelineRun>, StoreError> {
        self.inner.latest_pipeline_run(tenant_id, scope_id).await
    }

    async fn transition_pipeline_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        self.inner.transition_pipeline_run(id, from, to).await
    }

    async fn set_pipeline_run_cost(&self, id: &str, cost: f64) -> Result<(), StoreError> {
        self.inner.set_pipeline_run_cost(id, cost).await
    }

    async fn insert_stage_run(&self, run: &StageRun) -> Result<(), StoreError> {
        self.inner.insert_stage_run(run).await
    }

    async fn get_stage_run(&self, id: &str) -> Result<Option<StageRun>, StoreError> {
        self.inner.get_stage_run(id).await
    }

    async fn list_stage_runs(&self, pipeline_run_id: &str) -> Result<Vec<StageRun>, StoreError> {
        self.check(&self.fail_stage_run_lists, "stage run list")?;
        self.inner.list_stage_runs(pipeline_run_id).await
    }

    async fn update_stage_progress(
        &self,
        id: &str,
        progress: &StageProgress,
    ) -> Result<(), StoreError> {
        self.inner.update_stage_progress(id, progress).await
    }

    async fn transition_stage_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.check(&self.fail_stage_transitions, "stage run transition")?;
        self.inner.transition_stage_run(id, from, to, error).await
    }
}
