//! Shared deterministic types for harness core logic.
//!
//! These types define stable contracts between the filter engine, the
//! scheduler, the isolation runner and the result store. They do not touch
//! external state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::descriptor::{AgentDescriptor, TaskDescriptor};

/// Identifier of one run. Unique per execution; used as a directory name,
/// a container/image name suffix and the results file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Validate and wrap a run identifier (`[a-z0-9._-]+`, no `..`).
    pub fn parse(value: &str) -> Result<Self, String> {
        if value.is_empty() {
            return Err("run id must be non-empty".to_string());
        }
        if value.contains("..") {
            return Err(format!("run id {value:?} must not contain '..'"));
        }
        if !value.chars().all(|ch| {
            ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.')
        }) {
            return Err(format!("run id {value:?} must use [a-z0-9._-] only"));
        }
        Ok(Self(value.to_string()))
    }

    /// Build `<agent>.<task>.t<trial>.<suffix>`.
    pub fn compose(agent: &str, task: &str, trial: u32, suffix: &str) -> Result<Self, String> {
        Self::parse(&format!("{agent}.{task}.t{trial}.{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

/// Terminal status of a run. Every settled run has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Test step produced a valid score.
    Completed,
    /// Test step ran but reported a fatal condition distinct from a score.
    TestFailed,
    /// Environment, provisioning or results-file failure.
    InfrastructureError,
    /// The run exceeded its time budget.
    TimedOut,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Completed,
        RunStatus::TestFailed,
        RunStatus::InfrastructureError,
        RunStatus::TimedOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::TestFailed => "test_failed",
            RunStatus::InfrastructureError => "infrastructure_error",
            RunStatus::TimedOut => "timed_out",
        }
    }

    /// Statuses that make the overall invocation exit non-zero.
    pub fn is_harness_failure(self) -> bool {
        matches!(self, RunStatus::InfrastructureError | RunStatus::TimedOut)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (agent, task) pairing scheduled for execution.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: RunId,
    /// 1-indexed repeat number of this pairing within the batch.
    pub trial: u32,
    pub agent: Arc<AgentDescriptor>,
    pub task: Arc<TaskDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_composes_from_parts() {
        let id = RunId::compose("claude", "calc-go", 2, "abc123").expect("run id");
        assert_eq!(id.as_str(), "claude.calc-go.t2.abc123");
    }

    #[test]
    fn run_id_rejects_path_tricks() {
        assert!(RunId::parse("../etc").is_err());
        assert!(RunId::parse("a/b").is_err());
        assert!(RunId::parse("UPPER").is_err());
        assert!(RunId::parse("").is_err());
    }

    #[test]
    fn run_id_deserialization_validates() {
        let err = serde_json::from_str::<RunId>("\"bad id\"");
        assert!(err.is_err());
        let id: RunId = serde_json::from_str("\"ok-1\"").expect("valid id");
        assert_eq!(id.as_str(), "ok-1");
    }

    #[test]
    fn harness_failures_are_infrastructure_and_timeouts() {
        assert!(!RunStatus::Completed.is_harness_failure());
        assert!(!RunStatus::TestFailed.is_harness_failure());
        assert!(RunStatus::InfrastructureError.is_harness_failure());
        assert!(RunStatus::TimedOut.is_harness_failure());
    }
}
