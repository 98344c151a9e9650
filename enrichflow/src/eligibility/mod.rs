//! Eligibility: which entities may run a stage right now.

mod engine;
mod query;

pub use engine::EligibilityEngine;
pub use query::{
    CompletionLookup, DependencyClause, DependencySubject, EligibilityFilter, EligibilityQuery,
    Selection,
};
