//! Roll-up of settled run results into per-agent reports.
//!
//! Absent scores count as zero in `aggregate_score` but are tallied in
//! `unscored_runs`, so "scored zero" and "never produced a score" stay
//! distinguishable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::result::{RunResult, Score};
use crate::core::types::{RunId, RunStatus};

/// One planned run as recorded before scheduling.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlannedRun {
    pub run_id: RunId,
    pub agent: String,
    pub task: String,
    pub trial: u32,
}

/// Per-task line of an agent report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: String,
    pub trial: u32,
    pub run_id: RunId,
    /// `None` while the run has not settled.
    pub status: Option<RunStatus>,
    pub score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Analysis attached to an imperfect or failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    pub run_id: RunId,
    pub task: String,
    /// Path of the artifact file, relative to the batch directory.
    pub path: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent: String,
    /// Mean over all settled runs, absent scores counted as 0.
    pub aggregate_score: Option<f64>,
    /// Mean over runs that produced a score.
    pub mean_of_scored: Option<f64>,
    pub scored_runs: usize,
    pub unscored_runs: usize,
    pub pending_runs: usize,
    pub status_counts: BTreeMap<RunStatus, usize>,
    pub outcomes: Vec<TaskOutcome>,
    pub analyses: Vec<AnalysisArtifact>,
    /// Every planned run for the agent reached a terminal status.
    pub settled: bool,
}

/// Build the report for `agent` from its planned runs and whatever results exist.
pub fn assemble_agent_report<'a>(
    agent: &str,
    planned: &[PlannedRun],
    results: impl IntoIterator<Item = &'a RunResult>,
    analyses: &[AnalysisArtifact],
) -> AgentReport {
    let by_id: BTreeMap<&RunId, &RunResult> = results
        .into_iter()
        .filter(|result| result.agent == agent)
        .map(|result| (&result.run_id, result))
        .collect();

    let mut planned: Vec<&PlannedRun> = planned.iter().filter(|run| run.agent == agent).collect();
    planned.sort_by(|left, right| {
        (left.task.as_str(), left.trial, &left.run_id).cmp(&(
            right.task.as_str(),
            right.trial,
            &right.run_id,
        ))
    });

    let mut outcomes = Vec::with_capacity(planned.len());
    let mut status_counts = BTreeMap::new();
    let mut scored = Vec::new();
    let mut unscored_runs = 0usize;
    let mut pending_runs = 0usize;

    for run in &planned {
        match by_id.get(&run.run_id) {
            Some(result) => {
                *status_counts.entry(result.status()).or_insert(0) += 1;
                match result.score() {
                    Some(score) => scored.push(f64::from(score.value())),
                    None => unscored_runs += 1,
                }
                outcomes.push(TaskOutcome {
                    task: run.task.clone(),
                    trial: run.trial,
                    run_id: run.run_id.clone(),
                    status: Some(result.status()),
                    score: result.score(),
                    reason: result.outcome.reason().map(str::to_string),
                });
            }
            None => {
                pending_runs += 1;
                outcomes.push(TaskOutcome {
                    task: run.task.clone(),
                    trial: run.trial,
                    run_id: run.run_id.clone(),
                    status: None,
                    score: None,
                    reason: None,
                });
            }
        }
    }

    let settled_count = scored.len() + unscored_runs;
    let total: f64 = scored.iter().sum();
    let aggregate_score = (settled_count > 0).then(|| total / settled_count as f64);
    let mean_of_scored = (!scored.is_empty()).then(|| total / scored.len() as f64);

    let planned_ids: BTreeSet<&RunId> = planned.iter().map(|run| &run.run_id).collect();
    let mut analyses: Vec<AnalysisArtifact> = analyses
        .iter()
        .filter(|artifact| planned_ids.contains(&artifact.run_id))
        .cloned()
        .collect();
    analyses.sort_by(|left, right| left.run_id.cmp(&right.run_id));

    AgentReport {
        agent: agent.to_string(),
        aggregate_score,
        mean_of_scored,
        scored_runs: scored.len(),
        unscored_runs,
        pending_runs,
        status_counts,
        outcomes,
        analyses,
        settled: pending_runs == 0,
    }
}

/// Agent names in plan order, deduplicated and sorted.
pub fn planned_agents(planned: &[PlannedRun]) -> Vec<String> {
    let names: BTreeSet<&str> = planned.iter().map(|run| run.agent.as_str()).collect();
    names.into_iter().map(str::to_string).collect()
}
