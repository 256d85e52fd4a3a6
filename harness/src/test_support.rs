//! Test-only helpers: descriptor builders, a scripted container runtime and
//! scripted run executors.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::process::ExitStatusExt;
use std::fs;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde_json::Map;
use walkdir::WalkDir;

use crate::core::aggregate::PlannedRun;
use crate::core::budget::Deadline;
use crate::core::descriptor::{
    AgentDescriptor, DEFAULT_TEST_SCRIPT, Difficulty, TaskDescriptor, TestScript,
};
use crate::core::result::{Outcome, RunResult, Score};
use crate::core::types::{RunId, RunSpec};
use crate::error::RunError;
use crate::io::analysis::{AnalysisRequest, Analyzer};
use crate::io::loader::{
    AGENT_COMMAND_FILE, AGENT_CONFIG_FILE, AGENT_INSTALL_FILE, TASK_CONFIG_FILE,
    TASK_INSTRUCTIONS_FILE,
};
use crate::io::process::CommandOutput;
use crate::io::runtime::{BuildRequest, ContainerRequest, ContainerRuntime, ExecRequest, ExecStep};
use crate::isolation::{Execution, RUN_ID_ENV, RunExecutor, results_path};

/// Suffix used for run identifiers minted by these helpers.
pub const TEST_SUFFIX: &str = "abcdef";

/// Agent with an empty install recipe and a trivial command.
pub fn agent(name: &str) -> AgentDescriptor {
    AgentDescriptor {
        name: name.to_string(),
        install_recipe: String::new(),
        command_template: "echo {{ task_instructions }}".to_string(),
        required_env_vars: Vec::new(),
        tags: Vec::new(),
    }
}

/// Task with the default test script and no optional parts.
pub fn task(name: &str, difficulty: Difficulty) -> TaskDescriptor {
    TaskDescriptor {
        name: name.to_string(),
        difficulty,
        non_deterministic: false,
        required_env_vars: Vec::new(),
        tags: Vec::new(),
        setup_recipe: None,
        pre_test_script: None,
        test_script: TestScript {
            file_name: DEFAULT_TEST_SCRIPT.to_string(),
            contents: b"print('scripted')\n".to_vec(),
        },
        test_command: None,
        instructions: format!("{name} instructions"),
        data_dir: None,
    }
}

pub fn run_spec(agent: AgentDescriptor, task: TaskDescriptor, trial: u32) -> RunSpec {
    let run_id = RunId::compose(&agent.name, &task.name, trial, TEST_SUFFIX)
        .unwrap_or_else(|err| panic!("test run id: {err}"));
    RunSpec {
        run_id,
        trial,
        agent: Arc::new(agent),
        task: Arc::new(task),
    }
}

pub fn planned_run(agent: &str, task: &str, trial: u32) -> PlannedRun {
    PlannedRun {
        run_id: RunId::compose(agent, task, trial, TEST_SUFFIX)
            .unwrap_or_else(|err| panic!("test run id: {err}")),
        agent: agent.to_string(),
        task: task.to_string(),
        trial,
    }
}

/// Result for agent `a`, task `t`, trial 1.
pub fn result_with(run_id: &str, outcome: Outcome) -> RunResult {
    RunResult {
        run_id: RunId::parse(run_id).unwrap_or_else(|err| panic!("test run id: {err}")),
        agent: "a".to_string(),
        task: "t".to_string(),
        trial: 1,
        outcome,
        metadata: Map::new(),
        logs: String::new(),
        started_at: "2026-01-01T00:00:00+00:00".to_string(),
        finished_at: "2026-01-01T00:00:01+00:00".to_string(),
        duration_secs: 1.0,
    }
}

pub fn result_for(planned: &PlannedRun, outcome: Outcome) -> RunResult {
    RunResult {
        agent: planned.agent.clone(),
        task: planned.task.clone(),
        trial: planned.trial,
        ..result_with(planned.run_id.as_str(), outcome)
    }
}

/// Write a loadable agent directory `<root>/<name>/`.
pub fn write_agent_dir(root: &Path, name: &str, tags: &[&str]) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("create {}: {err}", dir.display()));
    write_fixture(&dir.join(AGENT_CONFIG_FILE), &format!("tags = {}\n", toml_list(tags)));
    write_fixture(&dir.join(AGENT_INSTALL_FILE), "RUN true\n");
    write_fixture(&dir.join(AGENT_COMMAND_FILE), "echo {{ task_instructions }}\n");
}

/// Write a loadable task directory `<root>/<name>/` with the default test script.
pub fn write_task_dir(root: &Path, name: &str, difficulty: Difficulty, tags: &[&str]) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("create {}: {err}", dir.display()));
    write_fixture(
        &dir.join(TASK_CONFIG_FILE),
        &format!(
            "tags = {}\n\n[task_info]\ndifficulty = \"{difficulty}\"\nnon_deterministic_evals = false\n",
            toml_list(tags)
        ),
    );
    write_fixture(&dir.join(TASK_INSTRUCTIONS_FILE), &format!("Solve {name}.\n"));
    write_fixture(&dir.join(DEFAULT_TEST_SCRIPT), "print('ok')\n");
}

fn write_fixture(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap_or_else(|err| panic!("write {}: {err}", path.display()));
}

fn toml_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("{item:?}")).collect();
    format!("[{}]", quoted.join(", "))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

fn scripted_output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(exit_status(code)),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        timed_out: false,
    }
}

/// Behaviour of a task's test step (and pre-test script) in [`ScriptedRuntime`].
#[derive(Debug, Clone, Default)]
pub struct StepScript {
    pub exit_code: i32,
    /// Results document written to the run's results path.
    pub results: Option<String>,
    pub sleep: Duration,
    pub pre_test_exit_code: i32,
}

impl StepScript {
    /// Exit 0 after writing `results`.
    pub fn results(results: &str) -> Self {
        Self {
            results: Some(results.to_string()),
            ..Self::default()
        }
    }

    /// Exit with `code` without writing results.
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn sleep(duration: Duration) -> Self {
        Self {
            sleep: duration,
            ..Self::default()
        }
    }

    pub fn with_results(mut self, results: &str) -> Self {
        self.results = Some(results.to_string());
        self
    }

    pub fn with_pre_test_exit(mut self, code: i32) -> Self {
        self.pre_test_exit_code = code;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct ContainerState {
    env: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    copied: Vec<String>,
    steps: Vec<ExecStep>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    scripts: BTreeMap<String, StepScript>,
    fail_builds: bool,
    images: BTreeSet<String>,
    containers: BTreeMap<String, ContainerState>,
    removed: BTreeMap<String, ContainerState>,
    builds: usize,
    started: usize,
    max_live: usize,
}

/// In-memory [`ContainerRuntime`].
///
/// Tracks live images and containers, refuses to start a second live
/// container under the same name, and plays back per-task [`StepScript`]s.
/// The task is recovered from the run identifier in the container name.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    state: Mutex<RuntimeState>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_task(&self, task: &str, script: StepScript) {
        lock(&self.state).scripts.insert(task.to_string(), script);
    }

    pub fn fail_builds(&self) {
        lock(&self.state).fail_builds = true;
    }

    pub fn add_leftover_container(&self, name: &str) {
        lock(&self.state)
            .containers
            .insert(name.to_string(), ContainerState::default());
    }

    pub fn add_leftover_image(&self, name: &str) {
        lock(&self.state).images.insert(name.to_string());
    }

    pub fn live_containers(&self) -> Vec<String> {
        lock(&self.state).containers.keys().cloned().collect()
    }

    pub fn live_images(&self) -> Vec<String> {
        lock(&self.state).images.iter().cloned().collect()
    }

    pub fn builds(&self) -> usize {
        lock(&self.state).builds
    }

    pub fn containers_started(&self) -> usize {
        lock(&self.state).started
    }

    /// Highest number of simultaneously live containers.
    pub fn max_live_containers(&self) -> usize {
        lock(&self.state).max_live
    }

    pub fn copied_files(&self, container: &str) -> Vec<String> {
        self.inspect(container, |state| state.copied.clone())
    }

    pub fn exec_steps(&self, container: &str) -> Vec<ExecStep> {
        self.inspect(container, |state| state.steps.clone())
    }

    pub fn container_env(&self, container: &str) -> BTreeMap<String, String> {
        self.inspect(container, |state| state.env.clone())
    }

    fn inspect<T: Default>(&self, container: &str, read: impl Fn(&ContainerState) -> T) -> T {
        let state = lock(&self.state);
        state
            .containers
            .get(container)
            .or_else(|| state.removed.get(container))
            .map(read)
            .unwrap_or_default()
    }

    fn script_for(&self, container: &str) -> StepScript {
        let task = container
            .strip_prefix("bench-")
            .and_then(|run_id| run_id.split('.').nth(1))
            .unwrap_or_default();
        lock(&self.state)
            .scripts
            .get(task)
            .cloned()
            .unwrap_or_else(|| StepScript::results(r#"{"score": 100, "metadata": {}}"#))
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn build_image(&self, request: &BuildRequest<'_>) -> Result<CommandOutput> {
        let mut state = lock(&self.state);
        state.builds += 1;
        if state.fail_builds {
            let mut output = scripted_output(1, "");
            output.stderr = b"scripted build failure\n".to_vec();
            return Ok(output);
        }
        state.images.insert(request.tag.to_string());
        Ok(scripted_output(0, "built\n"))
    }

    fn start_container(&self, request: &ContainerRequest<'_>) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.images.contains(request.image) {
            bail!("no such image {}", request.image);
        }
        if state.containers.contains_key(request.name) {
            bail!("container name {} already in use", request.name);
        }
        state.containers.insert(
            request.name.to_string(),
            ContainerState {
                env: request.env.clone(),
                ..ContainerState::default()
            },
        );
        state.started += 1;
        state.max_live = state.max_live.max(state.containers.len());
        Ok(())
    }

    fn copy_into(&self, container: &str, source: &Path, _dest: &str, _timeout: Duration) -> Result<()> {
        let mut copied = Vec::new();
        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(source)?;
                copied.push(relative.display().to_string());
            }
        }
        copied.sort();
        let mut state = lock(&self.state);
        let live = state
            .containers
            .get_mut(container)
            .ok_or_else(|| anyhow!("no such container {container}"))?;
        live.copied.extend(copied);
        Ok(())
    }

    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput> {
        {
            let mut state = lock(&self.state);
            let live = state
                .containers
                .get_mut(request.container)
                .ok_or_else(|| anyhow!("no such container {}", request.container))?;
            live.steps.push(request.step);
        }
        let script = self.script_for(request.container);
        match request.step {
            ExecStep::Agent => Ok(scripted_output(0, "agent done\n")),
            ExecStep::PreTest => Ok(scripted_output(script.pre_test_exit_code, "pre-test\n")),
            ExecStep::Test => {
                if script.sleep > request.timeout {
                    thread::sleep(request.timeout);
                    let mut output = scripted_output(0, "");
                    output.status = None;
                    output.timed_out = true;
                    return Ok(output);
                }
                thread::sleep(script.sleep);
                if let Some(results) = &script.results {
                    let run_id = request
                        .env
                        .get(RUN_ID_ENV)
                        .ok_or_else(|| anyhow!("test step without run id"))?;
                    let run_id = RunId::parse(run_id).map_err(|err| anyhow!(err))?;
                    let path = results_path(request.workdir, &run_id);
                    let mut state = lock(&self.state);
                    if let Some(live) = state.containers.get_mut(request.container) {
                        live.files.insert(path, results.as_bytes().to_vec());
                    }
                }
                Ok(scripted_output(script.exit_code, "tests ran\n"))
            }
        }
    }

    fn read_file(&self, container: &str, path: &str, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        let state = lock(&self.state);
        let live = state
            .containers
            .get(container)
            .ok_or_else(|| anyhow!("no such container {container}"))?;
        Ok(live.files.get(path).cloned())
    }

    fn logs(&self, container: &str, _timeout: Duration, _output_limit_bytes: usize) -> Result<CommandOutput> {
        if !lock(&self.state).containers.contains_key(container) {
            bail!("no such container {container}");
        }
        Ok(scripted_output(0, "scripted container log\n"))
    }

    fn remove_container(&self, container: &str, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(removed) = state.containers.remove(container) {
            state.removed.insert(container.to_string(), removed);
        }
        Ok(())
    }

    fn remove_image(&self, tag: &str, _timeout: Duration) -> Result<()> {
        lock(&self.state).images.remove(tag);
        Ok(())
    }

    fn labelled_containers(&self, _timeout: Duration) -> Result<Vec<String>> {
        Ok(self.live_containers())
    }

    fn labelled_images(&self, _timeout: Duration) -> Result<Vec<String>> {
        Ok(self.live_images())
    }
}

/// Scripted behaviour of a [`ScriptedExecutor`] run.
#[derive(Debug, Clone)]
pub enum Behavior {
    Score(u8),
    TestFailed,
    InfrastructureError,
    TimedOut,
    Panic,
    /// Block until the deadline passes, then report the timeout.
    SleepPastDeadline,
}

/// [`RunExecutor`] that plays back per-task behaviours without containers.
#[derive(Debug)]
pub struct ScriptedExecutor {
    default: Behavior,
    by_task: BTreeMap<String, Behavior>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            by_task: BTreeMap::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_task(mut self, task: &str, behavior: Behavior) -> Self {
        self.by_task.insert(task.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn play(&self, behavior: &Behavior, deadline: &Deadline) -> Result<Execution, RunError> {
        let outcome = match behavior {
            Behavior::Score(score) => Outcome::Completed {
                score: Score::new(*score).ok_or_else(|| anyhow!("scripted score out of range"))?,
            },
            Behavior::TestFailed => Outcome::TestFailed {
                reason: "scripted test failure".to_string(),
            },
            Behavior::InfrastructureError => {
                return Err(anyhow!("scripted infrastructure failure").into());
            }
            Behavior::TimedOut => return Err(deadline.timed_out("test")),
            Behavior::Panic => panic!("scripted panic"),
            Behavior::SleepPastDeadline => {
                thread::sleep(deadline.remaining());
                return Err(deadline.timed_out("agent"));
            }
        };
        Ok(Execution {
            outcome,
            metadata: Map::new(),
            logs: "scripted\n".to_string(),
        })
    }
}

impl RunExecutor for ScriptedExecutor {
    fn execute(&self, spec: &RunSpec, deadline: &Deadline) -> Result<Execution, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));

        let behavior = self
            .by_task
            .get(&spec.task.name)
            .unwrap_or(&self.default)
            .clone();
        catch_and_release(&self.in_flight, || self.play(&behavior, deadline))
    }
}

/// Run `play`, decrementing `in_flight` even if it panics.
fn catch_and_release<T>(in_flight: &AtomicUsize, play: impl FnOnce() -> T) -> T {
    struct Release<'a>(&'a AtomicUsize);
    impl Drop for Release<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }
    let _release = Release(in_flight);
    play()
}

/// [`Analyzer`] that counts calls. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct CountingAnalyzer {
    calls: Arc<AtomicUsize>,
}

impl CountingAnalyzer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Analyzer for CountingAnalyzer {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("# scripted analysis of {}\n", request.result.run_id))
    }
}
