//! Harness configuration stored in `bench.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Harness configuration (TOML).
///
/// Every field has a default so an absent or partial file is valid. Unknown
/// keys are rejected to catch typos early.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Maximum number of runs executing at once.
    pub max_parallel: usize,

    /// Wall-clock budget per run in seconds (build + agent + tests).
    pub run_timeout_secs: u64,

    /// Upper bound for the image build, further capped by the run budget.
    pub build_timeout_secs: u64,

    /// Budget for teardown commands; independent of the run budget.
    pub teardown_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per step.
    pub output_limit_bytes: usize,

    /// Repeats of every selected (agent, task) pair.
    pub trials: u32,

    pub runtime: RuntimeConfig,

    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Container runtime CLI (`docker` or a compatible binary).
    pub program: String,
    /// Image the base Dockerfile template starts `FROM`.
    pub base_image: String,
    /// Override for the embedded base Dockerfile template.
    pub base_template: Option<PathBuf>,
    /// Working directory inside the container.
    pub workdir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            base_image: "ubuntu:24.04".to_string(),
            base_template: None,
            workdir: "/project".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// External analysis command; unset means the built-in log digest.
    pub command: Option<Vec<String>>,
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            run_timeout_secs: 30 * 60,
            build_timeout_secs: 20 * 60,
            teardown_timeout_secs: 2 * 60,
            output_limit_bytes: 1_000_000,
            trials: 1,
            runtime: RuntimeConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.build_timeout_secs == 0 {
            return Err(anyhow!("build_timeout_secs must be > 0"));
        }
        if self.teardown_timeout_secs == 0 {
            return Err(anyhow!("teardown_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.trials == 0 {
            return Err(anyhow!("trials must be > 0"));
        }
        if self.runtime.program.trim().is_empty() {
            return Err(anyhow!("runtime.program must be non-empty"));
        }
        if self.runtime.base_image.trim().is_empty() {
            return Err(anyhow!("runtime.base_image must be non-empty"));
        }
        if !self.runtime.workdir.starts_with('/') {
            return Err(anyhow!("runtime.workdir must be an absolute path"));
        }
        if let Some(command) = &self.analysis.command
            && (command.is_empty() || command[0].trim().is_empty())
        {
            return Err(anyhow!("analysis.command must be a non-empty array"));
        }
        if self.analysis.timeout_secs == 0 {
            return Err(anyhow!("analysis.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
