//! Isolation runner: one run, one single-use container.
//!
//! Protocol per run:
//! 1. check required environment variables (before any container exists),
//!    render and build the image;
//! 2. stage task assets and copy them into the working directory;
//! 3. run the rendered agent command;
//! 4. run the pre-test script, if any (failure is recorded, not fatal);
//! 5. run the test command;
//! 6. read back and classify the results document.
//!
//! The container and image are removed by [`ContainerGuard`] on every exit
//! path, including errors and panics.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::Deadline;
use crate::core::classifier::{TestStepObservation, classify_test_step};
use crate::core::descriptor::required_env_vars;
use crate::core::result::Outcome;
use crate::core::types::{RunId, RunSpec};
use crate::error::RunError;
use crate::io::config::HarnessConfig;
use crate::io::loader::{TASK_INSTRUCTIONS_FILE, TASK_PRE_TEST_FILE};
use crate::io::process::CommandOutput;
use crate::io::render::Renderer;
use crate::io::run_log::{BatchPaths, RunPaths, append_text, copy_tree, write_text};
use crate::io::runtime::{
    BuildRequest, ContainerRequest, ContainerRuntime, ExecRequest, ExecStep, run_labels, tail,
};

/// Variable carrying the run identifier into the test step.
pub const RUN_ID_ENV: &str = "BENCH_RUN_ID";

/// Bytes of each step log kept in the result's log digest.
const DIGEST_BYTES_PER_LOG: usize = 4 * 1024;

/// What a run produced, before the scheduler stamps identity and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: Outcome,
    pub metadata: Map<String, Value>,
    pub logs: String,
}

/// Executes one run to a settled outcome.
///
/// Implementations must bound every blocking call by `deadline` and must not
/// leave environments behind, whatever they return.
pub trait RunExecutor: Send + Sync {
    fn execute(&self, spec: &RunSpec, deadline: &Deadline) -> Result<Execution, RunError>;
}

/// Name shared by a run's container and image.
pub fn environment_name(run_id: &RunId) -> String {
    format!("bench-{run_id}")
}

/// Path of the results document inside the container.
pub fn results_path(workdir: &str, run_id: &RunId) -> String {
    format!("{}/.bench_results_{run_id}.json", workdir.trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct IsolationSettings {
    pub build_timeout: Duration,
    pub teardown_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl IsolationSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            build_timeout: config.build_timeout(),
            teardown_timeout: config.teardown_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

/// Container-backed [`RunExecutor`].
pub struct IsolationRunner {
    runtime: Arc<dyn ContainerRuntime>,
    renderer: Renderer,
    batch: BatchPaths,
    host_env: BTreeMap<String, String>,
    settings: IsolationSettings,
}

impl IsolationRunner {
    /// Runner reading required variables from the current process environment.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        renderer: Renderer,
        batch: BatchPaths,
        settings: IsolationSettings,
    ) -> Self {
        Self::with_env(runtime, renderer, batch, settings, std::env::vars().collect())
    }

    /// Runner with an explicit environment snapshot.
    pub fn with_env(
        runtime: Arc<dyn ContainerRuntime>,
        renderer: Renderer,
        batch: BatchPaths,
        settings: IsolationSettings,
        host_env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            runtime,
            renderer,
            batch,
            host_env,
            settings,
        }
    }

    /// Values of the variables required by the pair; empty values count as missing.
    fn resolve_env(&self, spec: &RunSpec) -> Result<BTreeMap<String, String>, RunError> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        for var in required_env_vars(&spec.agent, &spec.task) {
            match self.host_env.get(&var) {
                Some(value) if !value.is_empty() => {
                    resolved.insert(var, value.clone());
                }
                _ => missing.push(var),
            }
        }
        if !missing.is_empty() {
            return Err(RunError::MissingEnvironment(missing));
        }
        Ok(resolved)
    }

    fn exec_step(
        &self,
        step: ExecStep,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
        paths: &RunPaths,
    ) -> Result<CommandOutput, RunError> {
        let stream_path = (step == ExecStep::Agent).then_some(paths.agent_log.as_path());
        let output = self.runtime.exec(&ExecRequest {
            step,
            container,
            argv,
            env,
            workdir: self.renderer.workdir(),
            timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
            stream_path,
        })?;
        match step {
            ExecStep::Agent => append_text(&paths.agent_log, &output.footer("agent"))?,
            ExecStep::PreTest => write_text(&paths.pre_test_log, &output.render_log("pre_test"))?,
            ExecStep::Test => write_text(&paths.test_log, &output.render_log("test"))?,
        }
        debug!(step = %step, exit_code = ?output.exit_code(), timed_out = output.timed_out, "step finished");
        Ok(output)
    }

    fn provision(
        &self,
        spec: &RunSpec,
        guard: &mut ContainerGuard<'_>,
        env: &BTreeMap<String, String>,
        deadline: &Deadline,
        paths: &RunPaths,
    ) -> Result<(), RunError> {
        let dockerfile = self.renderer.dockerfile(&spec.agent, &spec.task)?;
        let labels = run_labels(spec.run_id.as_str());

        let remaining = deadline.remaining_for("build")?;
        let build_timeout = self.settings.build_timeout.min(remaining);
        let build = self.runtime.build_image(&BuildRequest {
            tag: &guard.name,
            dockerfile: &dockerfile,
            labels: &labels,
            timeout: build_timeout,
        })?;
        // A build that ran may have tagged layers even when it failed.
        guard.image_requested = true;
        write_text(&paths.build_log, &build.render_log("build"))?;
        if build.timed_out {
            if deadline.is_expired() {
                return Err(deadline.timed_out("build"));
            }
            return Err(anyhow!(
                "image build exceeded build timeout of {}s",
                build_timeout.as_secs()
            )
            .into());
        }
        if !build.success() {
            return Err(anyhow!(
                "image build failed (exit {:?}): {}",
                build.exit_code(),
                tail(&build.stderr_lossy(), 2000)
            )
            .into());
        }

        // Only a container this attempt started is ours to remove; a failed
        // start may mean the name belongs to a live container.
        self.runtime.start_container(&ContainerRequest {
            name: &guard.name,
            image: &guard.name,
            env,
            labels: &labels,
            workdir: self.renderer.workdir(),
            timeout: deadline.remaining_for("start")?,
        })?;
        guard.container_requested = true;
        info!("environment ready");
        Ok(())
    }

    /// Stage instructions, data, test and pre-test scripts and copy them in.
    fn inject_assets(&self, spec: &RunSpec, container: &str, deadline: &Deadline) -> Result<(), RunError> {
        let staging = TempDir::new().context("create staging dir")?;
        let task = &spec.task;
        if let Some(data_dir) = &task.data_dir {
            copy_tree(data_dir, staging.path()).context("stage task data")?;
        }
        write_text(&staging.path().join(TASK_INSTRUCTIONS_FILE), &task.instructions)?;
        let script_path = staging.path().join(&task.test_script.file_name);
        fs::write(&script_path, &task.test_script.contents)
            .with_context(|| format!("write {}", script_path.display()))?;
        if let Some(pre_test) = &task.pre_test_script {
            write_text(&staging.path().join(TASK_PRE_TEST_FILE), pre_test)?;
        }
        self.runtime.copy_into(
            container,
            staging.path(),
            self.renderer.workdir(),
            deadline.remaining_for("inject")?,
        )?;
        Ok(())
    }

    fn run_in_container(
        &self,
        spec: &RunSpec,
        guard: &mut ContainerGuard<'_>,
        deadline: &Deadline,
        paths: &RunPaths,
    ) -> Result<Execution, RunError> {
        let env = self.resolve_env(spec)?;
        self.provision(spec, guard, &env, deadline, paths)?;
        let container = guard.name.clone();

        self.inject_assets(spec, &container, deadline)?;

        let command = self
            .renderer
            .agent_command(&spec.agent, &spec.task, &spec.run_id)?;
        let agent_argv = vec!["bash".to_string(), "-c".to_string(), command];
        let agent = self.exec_step(
            ExecStep::Agent,
            &container,
            &agent_argv,
            &BTreeMap::new(),
            deadline.remaining_for("agent")?,
            paths,
        )?;
        if agent.timed_out {
            return Err(deadline.timed_out("agent"));
        }
        if !agent.success() {
            info!(exit_code = ?agent.exit_code(), "agent exited non-zero, continuing to tests");
        }

        let step_env = BTreeMap::from([(RUN_ID_ENV.to_string(), spec.run_id.to_string())]);
        let workdir = self.renderer.workdir();

        let mut pre_test_failure = None;
        if spec.task.pre_test_script.is_some() {
            let argv = vec![
                "bash".to_string(),
                format!("{}/{TASK_PRE_TEST_FILE}", workdir.trim_end_matches('/')),
            ];
            let pre_test = self.exec_step(
                ExecStep::PreTest,
                &container,
                &argv,
                &step_env,
                deadline.remaining_for("pre_test")?,
                paths,
            )?;
            if pre_test.timed_out {
                return Err(deadline.timed_out("pre_test"));
            }
            if !pre_test.success() {
                warn!(exit_code = ?pre_test.exit_code(), "pre-test script failed");
                pre_test_failure = Some(pre_test.exit_code());
            }
        }

        let test_argv = spec.task.resolved_test_command(workdir);
        let test = self.exec_step(
            ExecStep::Test,
            &container,
            &test_argv,
            &step_env,
            deadline.remaining_for("test")?,
            paths,
        )?;

        let results = if test.timed_out {
            None
        } else {
            self.runtime.read_file(
                &container,
                &results_path(workdir, &spec.run_id),
                deadline.remaining_for("results")?,
            )?
        };
        let classification = classify_test_step(&TestStepObservation {
            exit_code: test.exit_code(),
            timed_out: test.timed_out,
            pre_test_failure,
            results: results.clone(),
        });
        if classification.report.is_some()
            && let Some(raw) = &results
        {
            fs::write(&paths.test_results, raw)
                .with_context(|| format!("write {}", paths.test_results.display()))?;
        }

        let mut metadata = classification.metadata;
        if let Some(code) = pre_test_failure {
            metadata.insert(
                "harness_pre_test_exit_code".to_string(),
                code.map_or(Value::Null, Value::from),
            );
        }
        Ok(Execution {
            outcome: classification.outcome,
            metadata,
            logs: log_digest(paths),
        })
    }

    fn capture_container_logs(&self, container: &str, paths: &RunPaths) {
        match self.runtime.logs(
            container,
            self.settings.teardown_timeout,
            self.settings.output_limit_bytes,
        ) {
            Ok(output) => {
                if let Err(err) = write_text(&paths.container_log, &output.render_log("container")) {
                    warn!(err = %format!("{err:#}"), "failed to write container log");
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "failed to capture container logs"),
        }
    }
}

impl RunExecutor for IsolationRunner {
    #[instrument(skip_all, fields(run_id = %spec.run_id, agent = %spec.agent.name, task = %spec.task.name))]
    fn execute(&self, spec: &RunSpec, deadline: &Deadline) -> Result<Execution, RunError> {
        let paths = self.batch.run(&spec.run_id);
        paths.ensure_dir()?;

        let mut guard = ContainerGuard {
            runtime: self.runtime.as_ref(),
            name: environment_name(&spec.run_id),
            timeout: self.settings.teardown_timeout,
            image_requested: false,
            container_requested: false,
        };
        let result = self.run_in_container(spec, &mut guard, deadline, &paths);
        if guard.container_requested {
            self.capture_container_logs(&guard.name, &paths);
        }
        drop(guard);

        match &result {
            Ok(execution) => info!(status = %execution.outcome.status(), "run finished"),
            Err(err) => warn!(kind = err.kind(), err = %format!("{err:#}"), "run failed"),
        }
        result
    }
}

/// Removes a run's container and image when dropped.
struct ContainerGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    name: String,
    timeout: Duration,
    image_requested: bool,
    container_requested: bool,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if self.container_requested
            && let Err(err) = self.runtime.remove_container(&self.name, self.timeout)
        {
            warn!(container = %self.name, err = %format!("{err:#}"), "failed to remove container");
        }
        if self.image_requested
            && let Err(err) = self.runtime.remove_image(&self.name, self.timeout)
        {
            warn!(image = %self.name, err = %format!("{err:#}"), "failed to remove image");
        }
        debug!(name = %self.name, "environment torn down");
    }
}

/// Bounded tail of each step log, for the result record.
fn log_digest(paths: &RunPaths) -> String {
    let mut digest = String::new();
    for (label, path) in [
        ("agent", &paths.agent_log),
        ("pre_test", &paths.pre_test_log),
        ("test", &paths.test_log),
    ] {
        let Ok(bytes) = fs::read(path) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        digest.push_str(&format!("--- {label} ---\n{}\n", tail(&text, DIGEST_BYTES_PER_LOG)));
    }
    digest
}
