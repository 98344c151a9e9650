//! Pipeline execution.
//!
//! This module provides:
//! - The reactive stage worker
//! - The pipeline coordinator: start, stop, supervision and status

mod coordinator;
mod worker;


pub use coordinator::{PipelineCoordinator, PipelineHandle, StartRequest, StartedPipeline};
pub use worker::{StageWorker, WorkerSpec};

use std::sync::Arc;

use crate::completion::CompletionRecorder;
use crate::config::EngineConfig;
use crate::eligibility::EligibilityEngine;
use crate::events::EventSink;
use crate::registry::StageRegistry;
use crate::store::PipelineStore;

/// Shared collaborators handed to every stage worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerServices {
    /// Backing store.
    pub store: Arc<dyn PipelineStore>,
    /// Eligibility evaluation.
    pub engine: EligibilityEngine,
    /// Completion writes.
    pub recorder: CompletionRecorder,
    /// Event sink.
    pub events: Arc<dyn EventSink>,
    /// Timing settings.
    pub config: EngineConfig,
}

impl WorkerServices {
    /// Wires the engine and recorder onto `store`.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn PipelineStore>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine: EligibilityEngine::new(registry, Arc::clone(&store)),
            recorder: CompletionRecorder::new(Arc::clone(&store)),
            store,
            events,
            config,
        }
    }
}
