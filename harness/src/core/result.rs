//! Run results and the test-step results document.
//!
//! `RunResult` is created once per run when the run settles and is never
//! mutated afterwards. The score lives inside [`Outcome::Completed`], so a
//! score exists exactly when the status is `Completed`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::{RunId, RunStatus};

/// Integer score in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const PERFECT: Score = Score(100);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 100).then_some(Self(value))
    }

    /// Round and clamp an arbitrary numeric score into range.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Self(value.round().clamp(0.0, 100.0) as u8))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_perfect(self) -> bool {
        self == Self::PERFECT
    }
}

impl TryFrom<u8> for Score {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Score::new(value).ok_or_else(|| format!("score {value} out of range 0..=100"))
    }
}

impl From<Score> for u8 {
    fn from(value: Score) -> Self {
        value.0
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { score: Score },
    TestFailed { reason: String },
    InfrastructureError { reason: String },
    TimedOut { reason: String },
}

impl Outcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Outcome::Completed { .. } => RunStatus::Completed,
            Outcome::TestFailed { .. } => RunStatus::TestFailed,
            Outcome::InfrastructureError { .. } => RunStatus::InfrastructureError,
            Outcome::TimedOut { .. } => RunStatus::TimedOut,
        }
    }

    pub fn score(&self) -> Option<Score> {
        match self {
            Outcome::Completed { score } => Some(*score),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Completed { .. } => None,
            Outcome::TestFailed { reason }
            | Outcome::InfrastructureError { reason }
            | Outcome::TimedOut { reason } => Some(reason),
        }
    }

    /// Build a non-scored outcome for `status`; `None` for `Completed`.
    pub fn unscored(status: RunStatus, reason: impl Into<String>) -> Option<Self> {
        let reason = reason.into();
        match status {
            RunStatus::Completed => None,
            RunStatus::TestFailed => Some(Outcome::TestFailed { reason }),
            RunStatus::InfrastructureError => Some(Outcome::InfrastructureError { reason }),
            RunStatus::TimedOut => Some(Outcome::TimedOut { reason }),
        }
    }
}

/// Settled outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RunResultRecord", into = "RunResultRecord")]
pub struct RunResult {
    pub run_id: RunId,
    pub agent: String,
    pub task: String,
    pub trial: u32,
    pub outcome: Outcome,
    /// Open mapping reported by the test step, plus harness annotations.
    pub metadata: Map<String, Value>,
    /// Execution log digest (bounded); full logs live next to `result.json`.
    pub logs: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: f64,
}

impl RunResult {
    pub fn status(&self) -> RunStatus {
        self.outcome.status()
    }

    pub fn score(&self) -> Option<Score> {
        self.outcome.score()
    }

    /// Completed with a score below 100.
    pub fn is_imperfect(&self) -> bool {
        self.score().is_some_and(|score| !score.is_perfect())
    }
}

/// Flat on-disk form of [`RunResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunResultRecord {
    run_id: RunId,
    agent: String,
    task: String,
    trial: u32,
    status: RunStatus,
    score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    logs: String,
    started_at: String,
    finished_at: String,
    duration_secs: f64,
}

impl TryFrom<RunResultRecord> for RunResult {
    type Error = String;

    fn try_from(record: RunResultRecord) -> Result<Self, Self::Error> {
        let outcome = match (record.status, record.score) {
            (RunStatus::Completed, Some(score)) => Outcome::Completed { score },
            (RunStatus::Completed, None) => {
                return Err("completed run must carry a score".to_string());
            }
            (status, None) => Outcome::unscored(status, record.reason.unwrap_or_default())
                .ok_or_else(|| format!("invalid status {status}"))?,
            (status, Some(_)) => {
                return Err(format!("{status} run must not carry a score"));
            }
        };
        Ok(Self {
            run_id: record.run_id,
            agent: record.agent,
            task: record.task,
            trial: record.trial,
            outcome,
            metadata: record.metadata,
            logs: record.logs,
            started_at: record.started_at,
            finished_at: record.finished_at,
            duration_secs: record.duration_secs,
        })
    }
}

impl From<RunResult> for RunResultRecord {
    fn from(result: RunResult) -> Self {
        Self {
            status: result.outcome.status(),
            score: result.outcome.score(),
            reason: result.outcome.reason().map(str::to_string),
            run_id: result.run_id,
            agent: result.agent,
            task: result.task,
            trial: result.trial,
            metadata: result.metadata,
            logs: result.logs,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_secs: result.duration_secs,
        }
    }
}

/// Results document written by a task's test script.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub score: Score,
    pub metadata: Map<String, Value>,
    /// Fatal condition reported by the test itself.
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTestReport {
    score: f64,
    metadata: Map<String, Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse the test step's results JSON.
///
/// `score` must be a number and `metadata` an object. Scores are rounded and
/// clamped to `0..=100`.
pub fn parse_test_report(contents: &[u8]) -> Result<TestReport, String> {
    let raw: RawTestReport =
        serde_json::from_slice(contents).map_err(|err| format!("malformed results: {err}"))?;
    let score =
        Score::from_f64(raw.score).ok_or_else(|| format!("invalid score {}", raw.score))?;
    let error = raw.error.filter(|message| !message.trim().is_empty());
    Ok(TestReport {
        score,
        metadata: raw.metadata,
        error,
    })
}
