//! Pipeline runs, stage runs and their exposed status shapes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::RunStatus;
use crate::registry::SoftDepToggles;

/// Tenant, scope and run identifiers shared by every component of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunScope {
    /// Owning tenant.
    pub tenant_id: String,
    /// Entity scope within the tenant.
    pub scope_id: String,
    /// The pipeline run.
    pub pipeline_run_id: String,
}

impl RunScope {
    /// Creates a run scope.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        pipeline_run_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope_id: scope_id.into(),
            pipeline_run_id: pipeline_run_id.into(),
        }
    }
}

/// Per-run selection filters and options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilters {
    /// Only entities assigned to this owner.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Only companies in one of these tiers (company stages only).
    #[serde(default)]
    pub tiers: Option<Vec<String>>,
    /// Maximum number of entities each stage processes.
    #[serde(default)]
    pub sample_size: Option<usize>,
    /// Soft dependency activation per stage.
    #[serde(default)]
    pub soft_deps: SoftDepToggles,
    /// Opaque context passed to every handler call.
    #[serde(default)]
    pub handler_context: Option<serde_json::Value>,
}

impl RunFilters {
    /// Creates empty filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Restricts company stages to the given tiers.
    #[must_use]
    pub fn with_tiers(mut self, tiers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tiers = Some(tiers.into_iter().map(Into::into).collect());
        self
    }

    /// Caps the number of entities per stage.
    #[must_use]
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    /// Sets soft dependency toggles.
    #[must_use]
    pub fn with_soft_deps(mut self, soft_deps: SoftDepToggles) -> Self {
        self.soft_deps = soft_deps;
        self
    }

    /// Sets the handler context.
    #[must_use]
    pub fn with_handler_context(mut self, context: serde_json::Value) -> Self {
        self.handler_context = Some(context);
        self
    }
}

/// One execution of a chosen subset of stages over a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Entity scope.
    pub scope_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Sum of stage run costs.
    pub cost: f64,
    /// Stage code to stage run id.
    pub stage_runs: BTreeMap<String, String>,
    /// Topological order of the selected stages.
    pub stage_order: Vec<String>,
    /// Filters the run was started with.
    pub filters: RunFilters,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Returns the run scope of this pipeline run.
    #[must_use]
    pub fn scope(&self) -> RunScope {
        RunScope::new(&self.tenant_id, &self.scope_id, &self.id)
    }
}

/// Status of the item a stage worker is currently handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The handler is running.
    Processing,
    /// The handler succeeded.
    Completed,
    /// The handler failed.
    Failed,
    /// A gate rejected the entity.
    Rejected,
}

/// The item a stage worker handled most recently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentItem {
    /// Entity id.
    pub entity_id: String,
    /// Entity display name.
    pub name: String,
    /// Handling status.
    pub status: ItemStatus,
}

/// An entry in the rolling recent-items log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentItem {
    /// Entity id.
    pub entity_id: String,
    /// Entity display name.
    pub name: String,
    /// Outcome.
    pub status: ItemStatus,
    /// Handler cost.
    pub cost: f64,
    /// Error text when the item failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the outcome was recorded.
    pub at: DateTime<Utc>,
}

/// Counters and progress fields a worker persists after every item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Entities processed successfully (including gate rejections).
    pub done: u64,
    /// Entities that failed.
    pub failed: u64,
    /// Entities dispatched or queued so far.
    pub total: u64,
    /// Accumulated handler cost.
    pub cost: f64,
    /// The item in flight or handled last.
    pub current_item: Option<CurrentItem>,
    /// Newest first.
    pub recent_items: Vec<RecentItem>,
}

impl StageProgress {
    /// Pushes an item to the front of the recent log, keeping at most `limit`.
    pub fn push_recent(&mut self, item: RecentItem, limit: usize) {
        self.recent_items.insert(0, item);
        self.recent_items.truncate(limit);
    }
}

/// One stage's share of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    /// Stage run id.
    pub id: String,
    /// Parent pipeline run.
    pub pipeline_run_id: String,
    /// Stage code.
    pub stage: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Progress counters.
    #[serde(flatten)]
    pub progress: StageProgress,
    /// Error text for failed stage runs.
    pub error: Option<String>,
    /// When the stage run was created.
    pub created_at: DateTime<Utc>,
    /// When the worker picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// Last write (status or progress).
    pub updated_at: DateTime<Utc>,
    /// When it reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRun {
    /// Creates a pending stage run.
    #[must_use]
    pub fn pending(
        id: impl Into<String>,
        pipeline_run_id: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pipeline_run_id: pipeline_run_id.into(),
            stage: stage.into(),
            status: RunStatus::Pending,
            progress: StageProgress::default(),
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Returns true if the run sits in a transient state without updates
    /// for longer than `window`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status.is_transient() && now - self.updated_at > window
    }
}

/// Exposed status shape of a stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunView {
    /// Stage code.
    pub stage: String,
    /// Effective status (stale runs report `failed`).
    pub status: RunStatus,
    /// Entities processed successfully.
    pub done: u64,
    /// Entities that failed.
    pub failed: u64,
    /// Entities dispatched or queued.
    pub total: u64,
    /// Accumulated cost.
    pub cost: f64,
    /// Current item.
    pub current_item: Option<CurrentItem>,
    /// Recent items, newest first.
    pub recent_items: Vec<RecentItem>,
    /// Error text.
    pub error: Option<String>,
}

impl StageRunView {
    /// Builds the view, applying the staleness rule.
    #[must_use]
    pub fn from_stage_run(run: &StageRun, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let (status, error) = if run.is_stale(now, stale_after) {
            (
                RunStatus::Failed,
                Some(format!(
                    "stale: no progress since {}",
                    run.updated_at.to_rfc3339()
                )),
            )
        } else {
            (run.status, run.error.clone())
        };

        Self {
            stage: run.stage.clone(),
            status,
            done: run.progress.done,
            failed: run.progress.failed,
            total: run.progress.total,
            cost: run.progress.cost,
            current_item: run.progress.current_item.clone(),
            recent_items: run.progress.recent_items.clone(),
            error,
        }
    }
}

/// Exposed status shape of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatusView {
    /// Run id.
    pub pipeline_run_id: String,
    /// Run status.
    pub status: RunStatus,
    /// Aggregated cost.
    pub cost: f64,
    /// Stage order.
    pub stage_order: Vec<String>,
    /// Per-stage status, in stage order.
    pub stages: Vec<StageRunView>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent(id: &str) -> RecentItem {
        RecentItem {
            entity_id: id.to_string(),
            name: id.to_uppercase(),
            status: ItemStatus::Completed,
            cost: 0.0,
            error: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_push_recent_keeps_newest_first() {
        let mut progress = StageProgress::default();
        for id in ["a", "b", "c", "d"] {
            progress.push_recent(recent(id), 3);
        }

        let ids: Vec<_> = progress.recent_items.iter().map(|i| i.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_stale_stage_run_reports_failed() {
        let mut run = StageRun::pending("sr1", "pr1", "l1");
        run.status = RunStatus::Running;
        run.updated_at = Utc::now() - Duration::minutes(10);

        let view = StageRunView::from_stage_run(&run, Utc::now(), Duration::minutes(5));
        assert_eq!(view.status, RunStatus::Failed);
        assert!(view.error.unwrap().starts_with("stale"));
    }

    #[test]
    fn test_pending_or_terminal_runs_are_never_stale() {
        let mut run = StageRun::pending("sr1", "pr1", "l1");
        run.updated_at = Utc::now() - Duration::hours(1);
        assert!(!run.is_stale(Utc::now(), Duration::minutes(5)));

        run.status = RunStatus::Completed;
        assert!(!run.is_stale(Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn test_stage_run_serializes_flat_progress() {
        let run = StageRun::pending("sr1", "pr1", "l1");
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["done"], 0);
        assert_eq!(json["status"], "pending");
    }
}
