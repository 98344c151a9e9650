//! Observability events emitted by stage workers and the coordinator.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Pipeline run lifecycle.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// A stop was requested for the run.
pub const PIPELINE_STOPPING: &str = "pipeline.stopping";
/// Every stage run finished and none failed.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// At least one stage run failed.
pub const PIPELINE_FAILED: &str = "pipeline.failed";
/// The run finished after a stop request.
pub const PIPELINE_STOPPED: &str = "pipeline.stopped";

/// A worker entered `running`.
pub const STAGE_STARTED: &str = "stage.started";
/// Gated entities were recorded as skipped.
pub const STAGE_AUTO_SKIPPED: &str = "stage.auto_skipped";
/// A handler succeeded for one entity.
pub const STAGE_ITEM_COMPLETED: &str = "stage.item_completed";
/// A handler failed or rejected one entity.
pub const STAGE_ITEM_FAILED: &str = "stage.item_failed";
/// A stage run completed.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage run failed.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage run stopped.
pub const STAGE_STOPPED: &str = "stage.stopped";
