//! CLI command implementations. Each returns the process exit code.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use harness::core::descriptor::{AgentDescriptor, TaskDescriptor};
use harness::core::filter::{FilterSet, select_pairs};
use harness::exit_codes;
use harness::io::analysis::analyzer_from_config;
use harness::io::config::load_config;
use harness::io::loader::{load_agents, load_tasks};
use harness::io::render::Renderer;
use harness::io::runtime::{DockerCli, clean_leftovers};
use harness::io::store::ResultStore;
use harness::isolation::{IsolationRunner, IsolationSettings};
use harness::plan::{Plan, batch_id, plan_runs, read_plan, write_plan};
use harness::report::{ReportGenerator, summary_line};
use harness::scheduler::Scheduler;
use tracing::{debug, info};

use crate::SelectionArgs;
use crate::config::{RunOverrides, apply_overrides};

type Pair = (Arc<AgentDescriptor>, Arc<TaskDescriptor>);

/// Load descriptors and apply the filters.
fn select(selection: &SelectionArgs) -> Result<Vec<Pair>> {
    let filters = FilterSet::parse(&selection.agent_filters, &selection.task_filters)?;
    let agents = load_agents(&selection.agents_dir)?;
    let tasks = load_tasks(&selection.tasks_dir)?;
    debug!(agents = agents.len(), tasks = tasks.len(), "descriptors loaded");
    Ok(select_pairs(&agents, &tasks, &filters)?)
}

/// Print the selected pairs, one per line.
pub fn list(selection: &SelectionArgs) -> Result<i32> {
    let pairs = select(selection)?;
    for (agent, task) in &pairs {
        println!("{}\t{}\t{}", agent.name, task.name, task.difficulty);
    }
    println!("list: pairs={}", pairs.len());
    Ok(exit_codes::OK)
}

/// Plan, execute and report one batch.
pub fn run(
    selection: &SelectionArgs,
    runs_dir: &Path,
    config_path: &Path,
    overrides: &RunOverrides,
) -> Result<i32> {
    let config = apply_overrides(load_config(config_path)?, overrides)
        .with_context(|| format!("apply overrides to {}", config_path.display()))?;
    let pairs = select(selection)?;
    if pairs.is_empty() {
        println!("run: nothing selected");
        return Ok(exit_codes::OK);
    }

    let now = Utc::now();
    let specs = plan_runs(&pairs, config.trials, &mut rand::thread_rng())?;
    let store = ResultStore::create_unique(runs_dir, &batch_id(now))?;
    let batch = store.batch().clone();
    let plan = Plan::new(&batch.id(), now, config.trials, &specs);
    write_plan(&batch, &plan).context("write plan")?;
    info!(batch = %batch.dir.display(), runs = specs.len(), "batch planned");

    let renderer = Renderer::from_config(&config.runtime)?;
    let runtime = Arc::new(DockerCli::new(
        &config.runtime.program,
        config.output_limit_bytes,
    ));
    let runner = IsolationRunner::new(
        runtime,
        renderer,
        batch.clone(),
        IsolationSettings::from_config(&config),
    );
    let generator = ReportGenerator::new(
        batch.clone(),
        plan.runs.clone(),
        analyzer_from_config(&config.analysis, config.output_limit_bytes),
    );

    let summary = Scheduler::new(&runner, &store, config.max_parallel, config.run_timeout()).run(
        specs,
        |result| {
            let score = result
                .score()
                .map_or_else(|| "-".to_string(), |score| score.value().to_string());
            println!(
                "run: {} status={} score={}",
                result.run_id,
                result.status(),
                score
            );
            generator.observe(result);
        },
    );

    for err in &summary.store_errors {
        eprintln!("warning: {err}");
    }
    for report in generator.finish()? {
        println!("report: {}", summary_line(&report));
    }
    println!("run: batch={}", batch.dir.display());

    Ok(if summary.has_harness_failures() {
        exit_codes::RUN_FAILURES
    } else {
        exit_codes::OK
    })
}

/// Rebuild every agent report of a stored batch.
pub fn report(batch_dir: &Path, config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = ResultStore::open(batch_dir)?;
    let plan = read_plan(store.batch())?;
    let generator = ReportGenerator::new(
        store.batch().clone(),
        plan.runs,
        analyzer_from_config(&config.analysis, config.output_limit_bytes),
    );
    for result in store.snapshot() {
        generator.observe(&result);
    }
    let reports = generator.finish()?;
    println!("report: batch={} runs={}", plan.batch_id, store.len());
    for report in &reports {
        println!("report: {}", summary_line(report));
    }
    Ok(exit_codes::OK)
}

/// Remove leftover labelled containers and images.
pub fn clean(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let runtime = DockerCli::new(&config.runtime.program, config.output_limit_bytes);
    let summary = clean_leftovers(&runtime, config.teardown_timeout())?;
    println!(
        "clean: containers={} images={} failures={}",
        summary.containers_removed, summary.images_removed, summary.failures
    );
    Ok(if summary.failures > 0 {
        exit_codes::RUN_FAILURES
    } else {
        exit_codes::OK
    })
}
