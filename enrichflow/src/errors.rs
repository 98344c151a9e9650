//! Error types for the enrichflow scheduler.
//!
//! Registry errors are fatal and surface synchronously when a pipeline is
//! started. Store and handler errors are mostly absorbed by the workers; they
//! are typed here so callers of the lower-level APIs can still inspect them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for enrichflow operations.
#[derive(Debug, Error)]
pub enum EnrichflowError {
    /// The stage registry rejected a configuration or a stage selection.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The backing store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// No handler is registered for a selected stage.
    #[error("No handler registered for stage '{stage}'")]
    UnknownHandler {
        /// The stage code without a handler.
        stage: String,
    },

    /// The referenced pipeline run does not exist.
    #[error("Pipeline run not found: {0}")]
    PipelineNotFound(String),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background worker or coordinator task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// Diagnostic metadata attached to registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "REGISTRY-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Errors raised by the stage registry.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The selected stages contain a dependency cycle.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A stage code is not part of the registry.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// Two descriptors share the same code.
    #[error("Duplicate stage code '{code}'")]
    DuplicateStage {
        /// The duplicated code.
        code: String,
    },

    /// A dependency edge is not allowed.
    #[error("Stage '{stage}' cannot depend on '{dependency}': {reason}")]
    InvalidDependency {
        /// The dependent stage.
        stage: String,
        /// The rejected dependency.
        dependency: String,
        /// Why the edge is rejected.
        reason: String,
    },
}

impl RegistryError {
    /// Returns diagnostic metadata for this error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Cycle(err) => err.error_info.clone(),
            Self::UnknownStage(err) => err.error_info.clone(),
            Self::DuplicateStage { code } => ErrorInfo::new(
                "REGISTRY-DUPLICATE",
                format!("Stage '{code}' is declared more than once"),
            ),
            Self::InvalidDependency { stage, dependency, .. } => ErrorInfo::new(
                "REGISTRY-INVALID_DEP",
                format!("Edge {stage} -> {dependency} is not allowed"),
            )
            .with_fix_hint("Company stages may only depend on company stages."),
        }
    }
}

/// Error raised when no topological order exists for the selected stages.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected among stages: {}", .stages.join(", "))]
pub struct CycleDetectedError {
    /// The stages that could not be ordered.
    pub stages: Vec<String>,
    /// Diagnostic metadata.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle error for the unordered stages.
    #[must_use]
    pub fn new(stages: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "REGISTRY-CYCLE",
            format!("Stages {} form a dependency cycle", stages.join(", ")),
        )
        .with_fix_hint(
            "Disable one of the soft dependencies in the cycle or drop a stage from the selection.",
        );

        Self {
            stages,
            error_info: info,
        }
    }
}

fn referenced_suffix(referenced_by: Option<&str>) -> String {
    referenced_by
        .map(|s| format!(" (referenced by '{s}')"))
        .unwrap_or_default()
}

/// Error raised when a stage code is absent from the registry.
#[derive(Debug, Clone, Error)]
#[error("Unknown stage '{code}'{}", referenced_suffix(.referenced_by.as_deref()))]
pub struct UnknownStageError {
    /// The unknown code.
    pub code: String,
    /// The stage whose dependency list referenced the code, if any.
    pub referenced_by: Option<String>,
    /// Diagnostic metadata.
    pub error_info: ErrorInfo,
}

impl UnknownStageError {
    /// Creates a new unknown stage error.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let info = ErrorInfo::new("REGISTRY-UNKNOWN_STAGE", format!("Stage '{code}' not found"))
            .with_fix_hint("Check the stage code for typos.");
        Self {
            code,
            referenced_by: None,
            error_info: info,
        }
    }

    /// Records which stage referenced the unknown code.
    #[must_use]
    pub fn referenced_by(mut self, stage: impl Into<String>) -> Self {
        self.referenced_by = Some(stage.into());
        self
    }
}

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The SQLite backend failed.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored JSON column could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record was expected but not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The record kind (e.g., "stage run").
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    /// A generic backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Error returned by a stage handler for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable error text, stored on the completion record.
    pub message: String,
    /// Whether a later run might succeed.
    pub retryable: bool,
}

impl HandlerError {
    /// Creates a permanent handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a retryable handler error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec!["a".to_string(), "b".to_string()]);

        assert!(err.to_string().contains("a, b"));
        assert_eq!(err.error_info.code, "REGISTRY-CYCLE");
        assert!(err.error_info.fix_hint.is_some());
    }

    #[test]
    fn test_unknown_stage_error_display() {
        let plain = UnknownStageError::new("l9");
        assert_eq!(plain.to_string(), "Unknown stage 'l9'");

        let referenced = UnknownStageError::new("l9").referenced_by("l2");
        assert_eq!(referenced.to_string(), "Unknown stage 'l9' (referenced by 'l2')");
    }

    #[test]
    fn test_registry_error_info() {
        let err = RegistryError::from(UnknownStageError::new("x"));
        assert_eq!(err.info().code, "REGISTRY-UNKNOWN_STAGE");

        let err = RegistryError::DuplicateStage { code: "l1".to_string() };
        assert_eq!(err.info().code, "REGISTRY-DUPLICATE");
    }

    #[test]
    fn test_enrichflow_error_from_registry() {
        let err: EnrichflowError =
            RegistryError::from(CycleDetectedError::new(vec!["a".into()])).into();
        assert!(matches!(err, EnrichflowError::Registry(RegistryError::Cycle(_))));
    }

    #[test]
    fn test_handler_error_retryable() {
        assert!(!HandlerError::new("boom").retryable);
        assert!(HandlerError::retryable("timeout").retryable);
    }
}
