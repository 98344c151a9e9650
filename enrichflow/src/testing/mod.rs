//! Testing utilities for enrichflow pipelines.
//!
//! This module provides:
//! - Mock, failing, slow and panicking stage handlers
//! - A store with injectable failures
//! - A seeded test world with a fast-ticking coordinator

mod fixtures;
mod mocks;

pub use fixtures::{TestWorld, TEST_SCOPE, TEST_TENANT};
pub use mocks::{FailingHandler, FailingStore, MockHandler, PanickingHandler, SlowHandler};
