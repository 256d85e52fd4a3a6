//! Container runtime adapter.
//!
//! The isolation runner talks to containers only through [`ContainerRuntime`].
//! [`DockerCli`] drives the `docker` CLI (or any CLI with the same surface);
//! tests use the scripted runtime from `test_support`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, RunOptions, run_command};

/// Label present on every container and image the harness creates.
pub const HARNESS_LABEL: &str = "bench.harness";
/// Label carrying the run identifier.
pub const RUN_ID_LABEL: &str = "bench.run_id";

/// Exit code used by [`DockerCli::read_file`] to signal an absent file.
const ABSENT_FILE_EXIT: i32 = 3;
/// Upper bound for files read back out of a container.
const READ_FILE_LIMIT: usize = 16 * 1024 * 1024;

/// Which run step a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecStep {
    Agent,
    PreTest,
    Test,
}

impl ExecStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecStep::Agent => "agent",
            ExecStep::PreTest => "pre_test",
            ExecStep::Test => "test",
        }
    }
}

impl fmt::Display for ExecStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image build request.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub tag: &'a str,
    pub dockerfile: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Detached container start request.
#[derive(Debug, Clone)]
pub struct ContainerRequest<'a> {
    pub name: &'a str,
    pub image: &'a str,
    /// Variables set inside the container; values never appear on the command line.
    pub env: &'a BTreeMap<String, String>,
    pub labels: &'a BTreeMap<String, String>,
    pub workdir: &'a str,
    pub timeout: Duration,
}

/// Command executed inside a running container.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub step: ExecStep,
    pub container: &'a str,
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub workdir: &'a str,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub stream_path: Option<&'a Path>,
}

/// Operations the harness needs from a container runtime.
///
/// Every call is bounded by the timeout it receives. Implementations must be
/// usable from several workers at once.
pub trait ContainerRuntime: Send + Sync {
    /// Build an image. A failed or timed-out build is reported through the output.
    fn build_image(&self, request: &BuildRequest<'_>) -> Result<CommandOutput>;
    /// Start a detached container that stays alive until removed.
    fn start_container(&self, request: &ContainerRequest<'_>) -> Result<()>;
    /// Copy the contents of a host directory into `dest` inside the container.
    fn copy_into(&self, container: &str, source: &Path, dest: &str, timeout: Duration) -> Result<()>;
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput>;
    /// Read a file from the container; `Ok(None)` when it does not exist.
    fn read_file(&self, container: &str, path: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;
    fn logs(&self, container: &str, timeout: Duration, output_limit_bytes: usize) -> Result<CommandOutput>;
    /// Force-remove a container and its anonymous volumes. Removing an absent container succeeds.
    fn remove_container(&self, container: &str, timeout: Duration) -> Result<()>;
    /// Force-remove an image. Removing an absent image succeeds.
    fn remove_image(&self, tag: &str, timeout: Duration) -> Result<()>;
    /// Containers carrying the harness label.
    fn labelled_containers(&self, timeout: Duration) -> Result<Vec<String>>;
    /// Images carrying the harness label.
    fn labelled_images(&self, timeout: Duration) -> Result<Vec<String>>;
}

/// Labels attached to everything created for `run_id`.
pub fn run_labels(run_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HARNESS_LABEL.to_string(), "1".to_string()),
        (RUN_ID_LABEL.to_string(), run_id.to_string()),
    ])
}

/// `docker`-compatible CLI runtime.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
    output_limit_bytes: usize,
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            program: program.into(),
            output_limit_bytes,
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Run a short management command and fail on timeout or non-zero exit.
    fn run_checked(&self, cmd: Command, what: &str, timeout: Duration) -> Result<CommandOutput> {
        let output = run_command(cmd, RunOptions::new(timeout, self.output_limit_bytes))
            .with_context(|| format!("run {what}"))?;
        if output.timed_out {
            bail!("{what} timed out after {}s", timeout.as_secs());
        }
        if !output.success() {
            bail!(
                "{what} failed (exit {:?}): {}",
                output.exit_code(),
                tail(&output.stderr_lossy(), 2000)
            );
        }
        Ok(output)
    }

    fn list_ids(&self, mut cmd: Command, what: &str, timeout: Duration) -> Result<Vec<String>> {
        cmd.arg("--filter").arg(format!("label={HARNESS_LABEL}=1"));
        let output = self.run_checked(cmd, what, timeout)?;
        let mut ids: Vec<String> = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

fn apply_labels(cmd: &mut Command, labels: &BTreeMap<String, String>) {
    for (key, value) in labels {
        cmd.arg("--label").arg(format!("{key}={value}"));
    }
}

/// Pass each variable by name so values come from the child's environment.
fn apply_env(cmd: &mut Command, env: &BTreeMap<String, String>) {
    for (key, value) in env {
        cmd.arg("-e").arg(key);
        cmd.env(key, value);
    }
}

impl ContainerRuntime for DockerCli {
    #[instrument(skip_all, fields(tag = request.tag))]
    fn build_image(&self, request: &BuildRequest<'_>) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.args(["build", "-t", request.tag]);
        apply_labels(&mut cmd, request.labels);
        cmd.arg("-");
        info!(timeout_secs = request.timeout.as_secs(), "building image");
        run_command(
            cmd,
            RunOptions::new(request.timeout, self.output_limit_bytes)
                .with_stdin(request.dockerfile.as_bytes()),
        )
        .context("run image build")
    }

    #[instrument(skip_all, fields(container = request.name))]
    fn start_container(&self, request: &ContainerRequest<'_>) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["run", "-d", "--name", request.name, "-w", request.workdir]);
        apply_labels(&mut cmd, request.labels);
        apply_env(&mut cmd, request.env);
        cmd.args([request.image, "sleep", "infinity"]);
        self.run_checked(cmd, "container start", request.timeout)?;
        debug!("container started");
        Ok(())
    }

    fn copy_into(&self, container: &str, source: &Path, dest: &str, timeout: Duration) -> Result<()> {
        let mut cmd = self.command();
        // Trailing `/.` copies the directory contents rather than the directory.
        cmd.arg("cp")
            .arg(format!("{}/.", source.display()))
            .arg(format!("{container}:{dest}"));
        self.run_checked(cmd, "copy into container", timeout)?;
        Ok(())
    }

    #[instrument(skip_all, fields(container = request.container, step = %request.step))]
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.args(["exec", "-w", request.workdir]);
        apply_env(&mut cmd, request.env);
        cmd.arg(request.container).args(request.argv);
        let mut options = RunOptions::new(request.timeout, request.output_limit_bytes);
        if let Some(path) = request.stream_path {
            options = options.with_stream(path);
        }
        run_command(cmd, options).with_context(|| format!("exec {} step", request.step))
    }

    fn read_file(&self, container: &str, path: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut cmd = self.command();
        cmd.args(["exec", container, "sh", "-c"])
            .arg(format!(
                "if [ -f \"$1\" ]; then cat \"$1\"; else exit {ABSENT_FILE_EXIT}; fi"
            ))
            .args(["sh", path]);
        let output = run_command(cmd, RunOptions::new(timeout, READ_FILE_LIMIT))
            .with_context(|| format!("read {path} from container"))?;
        if output.timed_out {
            bail!("reading {path} timed out after {}s", timeout.as_secs());
        }
        match output.exit_code() {
            Some(0) if output.stdout_truncated > 0 => {
                bail!("{path} exceeds {READ_FILE_LIMIT} bytes")
            }
            Some(0) => Ok(Some(output.stdout)),
            Some(ABSENT_FILE_EXIT) => Ok(None),
            code => bail!(
                "reading {path} failed (exit {code:?}): {}",
                tail(&output.stderr_lossy(), 2000)
            ),
        }
    }

    fn logs(&self, container: &str, timeout: Duration, output_limit_bytes: usize) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.args(["logs", container]);
        run_command(cmd, RunOptions::new(timeout, output_limit_bytes))
            .context("read container logs")
    }

    fn remove_container(&self, container: &str, timeout: Duration) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", "-v", container]);
        let output = run_command(cmd, RunOptions::new(timeout, self.output_limit_bytes))
            .context("run container removal")?;
        if output.timed_out {
            bail!("container removal timed out after {}s", timeout.as_secs());
        }
        if !output.success() && !is_missing_object(&output.stderr_lossy()) {
            bail!(
                "container removal failed: {}",
                tail(&output.stderr_lossy(), 2000)
            );
        }
        Ok(())
    }

    fn remove_image(&self, tag: &str, timeout: Duration) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rmi", "-f", tag]);
        let output = run_command(cmd, RunOptions::new(timeout, self.output_limit_bytes))
            .context("run image removal")?;
        if output.timed_out {
            bail!("image removal timed out after {}s", timeout.as_secs());
        }
        if !output.success() && !is_missing_object(&output.stderr_lossy()) {
            bail!("image removal failed: {}", tail(&output.stderr_lossy(), 2000));
        }
        Ok(())
    }

    fn labelled_containers(&self, timeout: Duration) -> Result<Vec<String>> {
        let mut cmd = self.command();
        cmd.args(["ps", "-aq"]);
        self.list_ids(cmd, "container listing", timeout)
    }

    fn labelled_images(&self, timeout: Duration) -> Result<Vec<String>> {
        let mut cmd = self.command();
        cmd.args(["images", "-q"]);
        self.list_ids(cmd, "image listing", timeout)
    }
}

fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

/// Last `max` bytes of `text`, on a char boundary.
pub fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Leftovers removed by [`clean_leftovers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub containers_removed: usize,
    pub images_removed: usize,
    pub failures: usize,
}

/// Remove every labelled container, then every labelled image.
///
/// Individual removal failures are logged and counted; listing failures abort.
#[instrument(skip_all)]
pub fn clean_leftovers(runtime: &dyn ContainerRuntime, timeout: Duration) -> Result<CleanSummary> {
    let mut summary = CleanSummary::default();
    for container in runtime.labelled_containers(timeout)? {
        match runtime.remove_container(&container, timeout) {
            Ok(()) => summary.containers_removed += 1,
            Err(err) => {
                warn!(container = %container, err = %format!("{err:#}"), "failed to remove container");
                summary.failures += 1;
            }
        }
    }
    for image in runtime.labelled_images(timeout)? {
        match runtime.remove_image(&image, timeout) {
            Ok(()) => summary.images_removed += 1,
            Err(err) => {
                warn!(image = %image, err = %format!("{err:#}"), "failed to remove image");
                summary.failures += 1;
            }
        }
    }
    info!(
        containers = summary.containers_removed,
        images = summary.images_removed,
        failures = summary.failures,
        "clean finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRuntime;

    #[test]
    fn labels_carry_run_id() {
        let labels = run_labels("a.t.t1.abcdef");
        assert_eq!(labels.get(HARNESS_LABEL).map(String::as_str), Some("1"));
        assert_eq!(
            labels.get(RUN_ID_LABEL).map(String::as_str),
            Some("a.t.t1.abcdef")
        );
    }

    #[test]
    fn tail_keeps_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo", 4), "llo");
    }

    #[test]
    fn missing_objects_are_recognised() {
        assert!(is_missing_object("Error: No such container: bench-x"));
        assert!(is_missing_object("Error response from daemon: image not found"));
        assert!(!is_missing_object("permission denied"));
    }

    #[test]
    fn clean_removes_leftovers() {
        let runtime = ScriptedRuntime::new();
        runtime.add_leftover_container("bench-old");
        runtime.add_leftover_image("bench-old");

        let summary = clean_leftovers(&runtime, Duration::from_secs(1)).expect("clean");
        assert_eq!(summary.containers_removed, 1);
        assert_eq!(summary.images_removed, 1);
        assert_eq!(summary.failures, 0);
        assert!(runtime.live_containers().is_empty());
        assert!(runtime.live_images().is_empty());
    }

    #[test]
    fn docker_cli_surfaces_missing_program() {
        let runtime = DockerCli::new("definitely-not-a-container-runtime", 1024);
        let err = runtime
            .labelled_containers(Duration::from_secs(1))
            .expect_err("missing program");
        assert!(format!("{err:#}").contains("container listing"));
    }
}
