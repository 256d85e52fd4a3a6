//! Report generator: per-run analysis and per-agent roll-up.
//!
//! [`ReportGenerator::observe`] is fed every settled result (from scheduler
//! workers, in any order). Completed runs below 100 and test failures get
//! exactly one analysis. When the last planned run of an agent settles, that
//! agent's report is assembled and written.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::aggregate::{AgentReport, AnalysisArtifact, PlannedRun, assemble_agent_report, planned_agents};
use crate::core::result::RunResult;
use crate::core::types::{RunId, RunStatus};
use crate::io::analysis::{AnalysisRequest, Analyzer};
use crate::io::run_log::{ANALYSIS_FILE, BatchPaths, write_json, write_text};

const SUMMARY_MAX_CHARS: usize = 200;

/// Whether a settled run gets an analysis artifact.
pub fn needs_analysis(result: &RunResult) -> bool {
    result.is_imperfect() || result.status() == RunStatus::TestFailed
}

#[derive(Debug, Default)]
struct ReportState {
    results: BTreeMap<RunId, RunResult>,
    analyses: Vec<AnalysisArtifact>,
    reported: BTreeSet<String>,
}

pub struct ReportGenerator {
    batch: BatchPaths,
    planned: Vec<PlannedRun>,
    analyzer: Box<dyn Analyzer>,
    requested: Mutex<BTreeSet<RunId>>,
    state: Mutex<ReportState>,
}

impl ReportGenerator {
    pub fn new(batch: BatchPaths, planned: Vec<PlannedRun>, analyzer: Box<dyn Analyzer>) -> Self {
        Self {
            batch,
            planned,
            analyzer,
            requested: Mutex::new(BTreeSet::new()),
            state: Mutex::new(ReportState::default()),
        }
    }

    /// Number of distinct runs an analysis was requested (or adopted) for.
    pub fn analysis_requests(&self) -> usize {
        lock(&self.requested).len()
    }

    /// Take in one settled result. Returns the analysis attached to it, if any.
    #[instrument(skip_all, fields(run_id = %result.run_id, agent = %result.agent))]
    pub fn observe(&self, result: &RunResult) -> Option<AnalysisArtifact> {
        let artifact = if needs_analysis(result) {
            self.analyze_once(result)
        } else {
            None
        };

        let settled_report = {
            let mut state = lock(&self.state);
            state.results.insert(result.run_id.clone(), result.clone());
            if let Some(artifact) = &artifact {
                state.analyses.push(artifact.clone());
            }
            let report = assemble_agent_report(
                &result.agent,
                &self.planned,
                state.results.values(),
                &state.analyses,
            );
            (report.settled && state.reported.insert(result.agent.clone())).then_some(report)
        };

        if let Some(report) = settled_report {
            info!(aggregate_score = ?report.aggregate_score, "agent settled");
            if let Err(err) = self.write_report(&report) {
                warn!(err = %format!("{err:#}"), "failed to write agent report");
            }
        }
        artifact
    }

    /// Request the analysis for `result` unless one was already requested.
    fn analyze_once(&self, result: &RunResult) -> Option<AnalysisArtifact> {
        if !lock(&self.requested).insert(result.run_id.clone()) {
            debug!("analysis already requested");
            return None;
        }
        let paths = self.batch.run(&result.run_id);
        let text = if paths.analysis.is_file() {
            match fs::read_to_string(&paths.analysis) {
                Ok(text) => text,
                Err(err) => {
                    warn!(err = %err, "failed to read existing analysis");
                    return None;
                }
            }
        } else {
            let text = match self.analyzer.analyze(&AnalysisRequest {
                result,
                paths: &paths,
            }) {
                Ok(text) => text,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "analysis failed");
                    format!("analysis failed: {err:#}\n")
                }
            };
            if let Err(err) = write_text(&paths.analysis, &text) {
                warn!(err = %format!("{err:#}"), "failed to write analysis");
            }
            text
        };
        Some(AnalysisArtifact {
            run_id: result.run_id.clone(),
            task: result.task.clone(),
            path: format!("{}/{ANALYSIS_FILE}", result.run_id),
            summary: summarize(&text),
        })
    }

    /// Assemble and write a report for every planned agent, settled or not.
    pub fn finish(&self) -> Result<Vec<AgentReport>> {
        let reports: Vec<AgentReport> = {
            let state = lock(&self.state);
            planned_agents(&self.planned)
                .iter()
                .map(|agent| {
                    assemble_agent_report(agent, &self.planned, state.results.values(), &state.analyses)
                })
                .collect()
        };
        for report in &reports {
            self.write_report(report)?;
        }
        Ok(reports)
    }

    fn write_report(&self, report: &AgentReport) -> Result<()> {
        let path = self.batch.report_path(&report.agent);
        write_json(&path, report).with_context(|| format!("write report for {}", report.agent))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First non-empty line of the analysis, bounded.
fn summarize(text: &str) -> String {
    let line = text
        .lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .unwrap_or("");
    line.chars().take(SUMMARY_MAX_CHARS).collect()
}

/// One-line summary of an agent report for terminal output.
pub fn summary_line(report: &AgentReport) -> String {
    let score = report
        .aggregate_score
        .map_or_else(|| "n/a".to_string(), |score| format!("{score:.1}"));
    let mut line = format!(
        "{}: aggregate {score} ({} scored, {} unscored",
        report.agent, report.scored_runs, report.unscored_runs
    );
    if report.pending_runs > 0 {
        line.push_str(&format!(", {} pending", report.pending_runs));
    }
    line.push(')');
    let failures: Vec<String> = report
        .status_counts
        .iter()
        .filter(|(status, _)| **status != RunStatus::Completed)
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    if !failures.is_empty() {
        line.push_str(&format!(" [{}]", failures.join(", ")));
    }
    line
}
