//! # Enrichflow
//!
//! A reactive DAG scheduler that advances business entities (companies and
//! their contacts) through a catalog of enrichment stages.
//!
//! Enrichflow provides:
//!
//! - **A static stage registry**: hard and soft dependencies, country gates,
//!   gate and terminal stages, topological ordering
//! - **Idempotent completion records**: one outcome per run, entity and stage
//! - **An eligibility engine**: which entities may run a stage right now
//! - **Reactive stage workers**: one per selected stage, all running at once,
//!   each picking up entities as soon as their prerequisites are met
//! - **A pipeline coordinator**: cooperative stop, cost aggregation and the
//!   final run status
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use enrichflow::prelude::*;
//!
//! let store = Arc::new(SqliteStore::open("enrichflow.db")?);
//! let handlers = HandlerRegistry::new()
//!     .with("l1", MyL1Handler::new())
//!     .with("triage", MyTriageHandler::new());
//!
//! let coordinator = PipelineCoordinator::new(StageRegistry::builtin(), handlers, store);
//! let started = coordinator
//!     .start(StartRequest::new("tenant-1", "import-42", ["l1", "triage"]))
//!     .await?;
//!
//! let status = started.handle.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod completion;
pub mod config;
pub mod core;
pub mod eligibility;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::completion::CompletionRecorder;
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        CompletionKey, CompletionRecord, CompletionStatus, Entity, EntityType,
        PipelineStatusView, RunFilters, RunScope, RunStatus, StageRunView,
    };
    pub use crate::eligibility::{EligibilityEngine, EligibilityFilter};
    pub use crate::errors::{
        CycleDetectedError, EnrichflowError, HandlerError, RegistryError, StoreError,
        UnknownStageError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::handlers::{
        HandlerContext, HandlerOutput, HandlerRegistry, StageHandler,
    };
    pub use crate::pipeline::{PipelineCoordinator, StartRequest, StartedPipeline};
    pub use crate::registry::{CountryGate, SoftDepToggles, StageDescriptor, StageRegistry};
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;
    pub use crate::store::{InMemoryStore, PipelineStore};
}
