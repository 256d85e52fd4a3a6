//! Batch planning: identifiers, trial expansion and the persisted plan.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::aggregate::PlannedRun;
use crate::core::descriptor::{AgentDescriptor, TaskDescriptor};
use crate::core::types::{RunId, RunSpec};
use crate::io::run_log::{BatchPaths, write_json};

const SUFFIX_LEN: usize = 6;

/// Persisted description of a batch, written before any run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub batch_id: String,
    pub created_at: String,
    pub trials: u32,
    pub runs: Vec<PlannedRun>,
}

impl Plan {
    pub fn new(batch_id: &str, created_at: DateTime<Utc>, trials: u32, specs: &[RunSpec]) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            created_at: created_at.to_rfc3339(),
            trials,
            runs: specs.iter().map(planned_run).collect(),
        }
    }
}

pub fn planned_run(spec: &RunSpec) -> PlannedRun {
    PlannedRun {
        run_id: spec.run_id.clone(),
        agent: spec.agent.name.clone(),
        task: spec.task.name.clone(),
        trial: spec.trial,
    }
}

/// Batch identifier: UTC timestamp `YYYYmmdd_HHMMSS`.
pub fn batch_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

fn random_suffix<R: Rng>(rng: &mut R) -> String {
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(SUFFIX_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Expand selected pairs into run specs, `trials` per pair, each with a fresh run id.
pub fn plan_runs<R: Rng>(
    pairs: &[(Arc<AgentDescriptor>, Arc<TaskDescriptor>)],
    trials: u32,
    rng: &mut R,
) -> Result<Vec<RunSpec>> {
    let mut seen = BTreeSet::new();
    let mut specs = Vec::with_capacity(pairs.len() * trials as usize);
    for (agent, task) in pairs {
        for trial in 1..=trials {
            let run_id = loop {
                let candidate =
                    RunId::compose(&agent.name, &task.name, trial, &random_suffix(rng))
                        .map_err(|err| anyhow!(err))
                        .with_context(|| format!("mint run id for {}/{}", agent.name, task.name))?;
                if seen.insert(candidate.clone()) {
                    break candidate;
                }
            };
            specs.push(RunSpec {
                run_id,
                trial,
                agent: Arc::clone(agent),
                task: Arc::clone(task),
            });
        }
    }
    debug!(pairs = pairs.len(), trials, runs = specs.len(), "planned runs");
    Ok(specs)
}

pub fn write_plan(batch: &BatchPaths, plan: &Plan) -> Result<()> {
    write_json(&batch.plan_path, plan)
}

pub fn read_plan(batch: &BatchPaths) -> Result<Plan> {
    let contents = fs::read_to_string(&batch.plan_path)
        .with_context(|| format!("read {}", batch.plan_path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", batch.plan_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::Difficulty;
    use crate::test_support::{agent, task};
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pairs() -> Vec<(Arc<AgentDescriptor>, Arc<TaskDescriptor>)> {
        vec![
            (Arc::new(agent("claude")), Arc::new(task("calc", Difficulty::Easy))),
            (Arc::new(agent("claude")), Arc::new(task("sort", Difficulty::Hard))),
        ]
    }

    #[test]
    fn batch_id_is_a_utc_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        assert_eq!(batch_id(now), "20260304_050607");
    }

    #[test]
    fn trials_multiply_runs_with_unique_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        let specs = plan_runs(&pairs(), 3, &mut rng).expect("plan");
        assert_eq!(specs.len(), 6);
        let ids: BTreeSet<&RunId> = specs.iter().map(|spec| &spec.run_id).collect();
        assert_eq!(ids.len(), 6);
        assert_eq!(specs[2].trial, 3);
        assert!(specs[2].run_id.as_str().starts_with("claude.calc.t3."));
    }

    #[test]
    fn plan_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let batch = BatchPaths::new(temp.path(), "20260304_050607");
        let mut rng = StdRng::seed_from_u64(1);
        let specs = plan_runs(&pairs(), 1, &mut rng).expect("plan");
        let plan = Plan::new("20260304_050607", Utc::now(), 1, &specs);

        write_plan(&batch, &plan).expect("write");
        let loaded = read_plan(&batch).expect("read");
        assert_eq!(loaded, plan);
        assert_eq!(loaded.runs[1].task, "sort");
    }
}
