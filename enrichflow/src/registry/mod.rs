//! Stage registry.
//!
//! This module provides:
//! - Stage descriptors and country gates
//! - The built-in, compiled-once stage catalog
//! - Dependency resolution and topological ordering

mod catalog;
mod descriptor;

pub use catalog::StageRegistry;
pub use descriptor::{CountryGate, SoftDepToggles, StageDescriptor};
