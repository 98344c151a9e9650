//! Run status, completion status and entity type enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::StoreError;

/// The kind of business entity a stage operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A company (account).
    Company,
    /// A contact person, owned by a company.
    Contact,
}

impl EntityType {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Contact => "contact",
        }
    }

    /// Returns the entity type referenced through `parent_id`, if any.
    #[must_use]
    pub const fn parent_type(&self) -> Option<Self> {
        match self {
            Self::Company => None,
            Self::Contact => Some(Self::Company),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(Self::Company),
            "contact" => Ok(Self::Contact),
            other => Err(StoreError::InvalidValue(format!("entity type '{other}'"))),
        }
    }
}

/// Lifecycle status shared by pipeline runs and stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up.
    #[default]
    Pending,
    /// Actively processing.
    Running,
    /// A stop was requested and has not been honoured yet.
    Stopping,
    /// Finished normally.
    Completed,
    /// Finished with failures only.
    Failed,
    /// Finished because a stop was requested.
    Stopped,
}

impl RunStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Returns true for states that should be making progress.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Non-terminal statuses, used as compare-and-set guards.
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Running, Self::Stopping];
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(StoreError::InvalidValue(format!("run status '{other}'"))),
        }
    }
}

/// Outcome of one entity for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The handler succeeded.
    Completed,
    /// The handler failed or rejected the entity.
    Failed,
    /// The stage does not apply to the entity.
    Skipped,
}

impl CompletionStatus {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if a dependent stage may treat this outcome as done.
    #[must_use]
    pub const fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StoreError::InvalidValue(format!("completion status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_is_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
    }

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Stopping,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Stopping).unwrap();
        assert_eq!(json, r#""stopping""#);
    }

    #[test]
    fn test_completion_status_satisfies_dependency() {
        assert!(CompletionStatus::Completed.satisfies_dependency());
        assert!(CompletionStatus::Skipped.satisfies_dependency());
        assert!(!CompletionStatus::Failed.satisfies_dependency());
    }

    #[test]
    fn test_entity_type_parent() {
        assert_eq!(EntityType::Contact.parent_type(), Some(EntityType::Company));
        assert_eq!(EntityType::Company.parent_type(), None);
        assert_eq!("contact".parse::<EntityType>().unwrap(), EntityType::Contact);
    }
}
