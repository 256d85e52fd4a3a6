//! Typed error taxonomy.
//!
//! Pre-scheduling errors (`FilterError`, `DescriptorError`) abort the whole
//! invocation. `RunError` is scoped to one run and is converted into a
//! terminal `RunResult` at the worker boundary. `StoreError` is raised by the
//! result store.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::result::Outcome;
use crate::core::types::{RunId, RunStatus};

/// Invalid filter predicate (surfaced before anything is scheduled).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("malformed filter {0:?} (expected key=value or key!=value)")]
    Malformed(String),
    #[error("unknown {kind} filter attribute {attribute:?} (known: {known})")]
    UnknownAttribute {
        kind: &'static str,
        attribute: String,
        known: String,
    },
    #[error("invalid value {value:?} for {attribute}: {reason}")]
    InvalidValue {
        attribute: String,
        value: String,
        reason: String,
    },
}

/// A descriptor directory could not be turned into a descriptor.
#[derive(Debug, Error)]
#[error("invalid {kind} descriptor {}: {reason}", path.display())]
pub struct DescriptorError {
    pub kind: &'static str,
    pub path: PathBuf,
    pub reason: String,
}

/// Failure of a single run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnvironment(Vec<String>),
    #[error("{step} exceeded the run budget of {budget_secs}s")]
    TimedOut { step: &'static str, budget_secs: u64 },
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl RunError {
    /// Terminal status a run ends in when it fails with this error.
    pub fn status(&self) -> RunStatus {
        match self {
            RunError::MissingEnvironment(_) | RunError::Infrastructure(_) => {
                RunStatus::InfrastructureError
            }
            RunError::TimedOut { .. } => RunStatus::TimedOut,
        }
    }

    /// Terminal outcome recorded for a run that failed with this error.
    pub fn outcome(&self) -> Outcome {
        let reason = format!("{self:#}");
        match self {
            RunError::MissingEnvironment(_) | RunError::Infrastructure(_) => {
                Outcome::InfrastructureError { reason }
            }
            RunError::TimedOut { .. } => Outcome::TimedOut { reason },
        }
    }

    /// Short machine-readable kind recorded in result metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::MissingEnvironment(_) => "missing_environment",
            RunError::TimedOut { .. } => "timed_out",
            RunError::Infrastructure(_) => "infrastructure",
        }
    }
}

/// Result store rejection or persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} is already recorded")]
    DuplicateRun(RunId),
    #[error("persist run {run_id}")]
    Persist {
        run_id: RunId,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn run_errors_map_to_statuses() {
        let missing = RunError::MissingEnvironment(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(missing.status(), RunStatus::InfrastructureError);
        assert_eq!(
            missing.to_string(),
            "missing required environment variables: A, B"
        );

        let timed_out = RunError::TimedOut {
            step: "agent",
            budget_secs: 5,
        };
        assert_eq!(timed_out.status(), RunStatus::TimedOut);

        let infra = RunError::from(anyhow!("docker build failed"));
        assert_eq!(infra.status(), RunStatus::InfrastructureError);
        assert_eq!(infra.kind(), "infrastructure");
        assert_eq!(
            infra.outcome().reason(),
            Some("docker build failed")
        );
        assert_eq!(timed_out.outcome().status(), RunStatus::TimedOut);
    }
}
