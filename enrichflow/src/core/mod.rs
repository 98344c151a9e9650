//! Core domain model types for enrichflow.
//!
//! This module contains the records shared by every component:
//! - Status and entity type enums
//! - Entities, completion records, pipeline and stage runs
//! - The exposed status views

mod completion;
mod entity;
mod run;
mod status;

pub use completion::{CompletionKey, CompletionRecord};
pub use entity::{normalize_domain, Entity};
pub use run::{
    CurrentItem, ItemStatus, PipelineRun, PipelineStatusView, RecentItem, RunFilters, RunScope,
    StageProgress, StageRun, StageRunView,
};
pub use status::{CompletionStatus, EntityType, RunStatus};
