//! End-to-end sweeps through the scheduler, isolation runner and report
//! generator against the scripted container runtime.

use std::sync::Arc;
use std::time::Duration;

use harness::core::descriptor::Difficulty;
use harness::core::filter::{FilterSet, select_pairs};
use harness::core::types::{RunSpec, RunStatus};
use harness::io::config::RuntimeConfig;
use harness::io::loader::{load_agents, load_tasks};
use harness::io::render::Renderer;
use harness::io::run_log::BatchPaths;
use harness::io::store::ResultStore;
use harness::isolation::{IsolationRunner, IsolationSettings};
use harness::report::ReportGenerator;
use harness::scheduler::Scheduler;
use harness::test_support::{
    CountingAnalyzer, ScriptedRuntime, StepScript, agent, run_spec, task, write_agent_dir,
    write_task_dir,
};
use tempfile::TempDir;

struct Sweep {
    _temp: TempDir,
    runtime: Arc<ScriptedRuntime>,
    runner: IsolationRunner,
    store: ResultStore,
}

fn sweep() -> Sweep {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());
    let batch = BatchPaths::new(temp.path(), "20260101_000000");
    let runner = IsolationRunner::with_env(
        runtime.clone(),
        Renderer::from_config(&RuntimeConfig::default()).expect("renderer"),
        batch.clone(),
        IsolationSettings {
            build_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
        },
        Default::default(),
    );
    let store = ResultStore::create(batch).expect("store");
    Sweep {
        _temp: temp,
        runtime,
        runner,
        store,
    }
}

fn matrix(agents: &[&str], tasks: &[&str]) -> Vec<RunSpec> {
    let mut specs = Vec::new();
    for agent_name in agents {
        for task_name in tasks {
            specs.push(run_spec(agent(agent_name), task(task_name, Difficulty::Medium), 1));
        }
    }
    specs
}

#[test]
fn broken_task_fails_every_agent_without_blocking_the_rest() {
    let sw = sweep();
    sw.runtime
        .script_task("good", StepScript::results(r#"{"score": 100, "metadata": {}}"#));
    sw.runtime.script_task("broken", StepScript::exit(1));
    let specs = matrix(&["a1", "a2", "a3"], &["good", "broken"]);

    let summary = Scheduler::new(&sw.runner, &sw.store, 2, Duration::from_secs(30)).run(specs, |_| {});

    assert_eq!(summary.results.len(), 6);
    assert_eq!(sw.store.len(), 6);
    let counts = summary.status_counts();
    assert_eq!(counts.get(&RunStatus::Completed), Some(&3));
    assert_eq!(counts.get(&RunStatus::InfrastructureError), Some(&3));
    for result in summary.results.iter().filter(|result| result.task == "broken") {
        assert!(result.score().is_none());
    }
    assert!(summary.has_harness_failures());
    assert!(sw.runtime.max_live_containers() <= 2);
    assert!(sw.runtime.live_containers().is_empty());
    assert!(sw.runtime.live_images().is_empty());
}

#[test]
fn timed_out_run_leaves_nothing_behind() {
    let sw = sweep();
    sw.runtime.script_task(
        "slow",
        StepScript::sleep(Duration::from_secs(10)).with_results(r#"{"score": 100, "metadata": {}}"#),
    );
    let specs = matrix(&["a1"], &["slow", "fast"]);

    let summary =
        Scheduler::new(&sw.runner, &sw.store, 2, Duration::from_millis(500)).run(specs, |_| {});

    let slow = summary
        .results
        .iter()
        .find(|result| result.task == "slow")
        .expect("slow result");
    assert_eq!(slow.status(), RunStatus::TimedOut);
    assert!(slow.score().is_none());
    let fast = summary
        .results
        .iter()
        .find(|result| result.task == "fast")
        .expect("fast result");
    assert_eq!(fast.status(), RunStatus::Completed);
    assert!(sw.runtime.live_containers().is_empty());
    assert!(sw.runtime.live_images().is_empty());
}

#[test]
fn imperfect_score_gets_one_analysis_and_a_report() {
    let sw = sweep();
    sw.runtime
        .script_task("calc", StepScript::results(r#"{"score": 87, "metadata": {}}"#));
    let specs = matrix(&["claude"], &["calc"]);
    let planned: Vec<_> = specs.iter().map(harness::plan::planned_run).collect();
    let analyzer = CountingAnalyzer::default();
    let generator = ReportGenerator::new(
        sw.store.batch().clone(),
        planned,
        Box::new(analyzer.clone()),
    );

    let summary = Scheduler::new(&sw.runner, &sw.store, 2, Duration::from_secs(30))
        .run(specs, |result| {
            generator.observe(result);
        });
    let reports = generator.finish().expect("finish");

    assert_eq!(summary.results[0].score().map(|score| score.value()), Some(87));
    assert_eq!(analyzer.calls(), 1);
    let run_paths = sw.store.batch().run(&summary.results[0].run_id);
    assert!(run_paths.analysis.is_file());
    assert!(run_paths.result.is_file());
    assert_eq!(reports.len(), 1);
    assert!(reports[0].settled);
    assert_eq!(reports[0].aggregate_score, Some(87.0));
    assert_eq!(reports[0].analyses.len(), 1);
    assert!(sw.store.batch().report_path("claude").is_file());
}

#[test]
fn hard_filter_selects_only_hard_tasks_from_disk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agents_dir = temp.path().join("agents");
    let tasks_dir = temp.path().join("tasks");
    write_agent_dir(&agents_dir, "claude", &[]);
    write_agent_dir(&agents_dir, "codex", &["beta"]);
    write_task_dir(&tasks_dir, "calc", Difficulty::Easy, &[]);
    write_task_dir(&tasks_dir, "compiler", Difficulty::Hard, &[]);
    write_task_dir(&tasks_dir, "kernel", Difficulty::Hard, &["systems"]);

    let agents = load_agents(&agents_dir).expect("agents");
    let tasks = load_tasks(&tasks_dir).expect("tasks");
    let filters = FilterSet::parse(["tag!=beta"], ["difficulty=hard"]).expect("filters");
    let pairs = select_pairs(&agents, &tasks, &filters).expect("pairs");

    let names: Vec<(String, String)> = pairs
        .iter()
        .map(|(agent, task)| (agent.name.clone(), task.name.clone()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("claude".to_string(), "compiler".to_string()),
            ("claude".to_string(), "kernel".to_string()),
        ]
    );
}

#[test]
fn resubmitted_run_is_rejected_by_the_store() {
    let sw = sweep();
    let spec = run_spec(agent("a1"), task("calc", Difficulty::Easy), 1);

    let first = Scheduler::new(&sw.runner, &sw.store, 1, Duration::from_secs(30))
        .run(vec![spec.clone()], |_| {});
    let stored = sw.store.get(&spec.run_id).expect("stored");
    let second =
        Scheduler::new(&sw.runner, &sw.store, 1, Duration::from_secs(30)).run(vec![spec], |_| {});

    assert!(first.store_errors.is_empty());
    assert!(second.results.is_empty());
    assert_eq!(second.store_errors.len(), 1);
    assert_eq!(sw.runtime.builds(), 1);
    assert_eq!(sw.store.len(), 1);
    assert_eq!(sw.store.get(&stored.run_id), Some(stored));
}

#[test]
fn repeated_spec_in_one_sweep_runs_once_and_keeps_its_container() {
    let sw = sweep();
    sw.runtime.script_task(
        "calc",
        StepScript::sleep(Duration::from_millis(300)).with_results(r#"{"score": 92, "metadata": {}}"#),
    );
    let spec = run_spec(agent("a1"), task("calc", Difficulty::Easy), 1);

    let summary = Scheduler::new(&sw.runner, &sw.store, 2, Duration::from_secs(30))
        .run(vec![spec.clone(), spec.clone()], |_| {});

    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.store_errors.len(), 1);
    assert_eq!(sw.runtime.containers_started(), 1);
    let stored = sw.store.get(&spec.run_id).expect("stored");
    assert_eq!(stored.status(), RunStatus::Completed);
    assert_eq!(stored.score().map(|score| score.value()), Some(92));
    assert!(sw.runtime.live_containers().is_empty());
    assert!(sw.runtime.live_images().is_empty());
}
