//! Analysis collaborators for imperfect or failed runs.
//!
//! The report generator decides *when* to analyse; implementations of
//! [`Analyzer`] decide *what* the artifact says.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::core::result::RunResult;
use crate::io::config::AnalysisConfig;
use crate::io::process::{RunOptions, run_command};
use crate::io::run_log::RunPaths;
use crate::io::runtime::tail;

/// Lines kept from each log in the built-in digest.
const DIGEST_TAIL_LINES: usize = 40;

pub struct AnalysisRequest<'a> {
    pub result: &'a RunResult,
    pub paths: &'a RunPaths,
}

/// Produces a markdown analysis for one settled run.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<String>;
}

/// Pick the analyzer described by the config.
pub fn analyzer_from_config(config: &AnalysisConfig, output_limit_bytes: usize) -> Box<dyn Analyzer> {
    match &config.command {
        Some(command) => Box::new(CommandAnalyzer {
            command: command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes,
        }),
        None => Box::new(LogSummaryAnalyzer),
    }
}

/// Deterministic digest of the outcome, metadata and log tails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSummaryAnalyzer;

impl Analyzer for LogSummaryAnalyzer {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<String> {
        let result = request.result;
        let mut buf = String::new();
        match result.score() {
            Some(score) => buf.push_str(&format!(
                "{} scored {}/100 on {} ({})\n",
                result.agent,
                score.value(),
                result.task,
                result.status()
            )),
            None => buf.push_str(&format!(
                "{} produced no score on {} ({})\n",
                result.agent,
                result.task,
                result.status()
            )),
        }
        buf.push_str(&format!("\nRun: `{}` (trial {})\n", result.run_id, result.trial));
        if let Some(reason) = result.outcome.reason() {
            buf.push_str(&format!("\n## Reason\n\n{reason}\n"));
        }
        if !result.metadata.is_empty() {
            let metadata =
                serde_json::to_string_pretty(&result.metadata).context("serialize metadata")?;
            buf.push_str(&format!("\n## Test metadata\n\n```json\n{metadata}\n```\n"));
        }
        for (title, path) in [
            ("Test output", &request.paths.test_log),
            ("Pre-test output", &request.paths.pre_test_log),
            ("Agent output", &request.paths.agent_log),
        ] {
            if let Some(lines) = tail_lines(path, DIGEST_TAIL_LINES)? {
                buf.push_str(&format!("\n## {title} (last {DIGEST_TAIL_LINES} lines)\n\n```\n{lines}\n```\n"));
            }
        }
        Ok(buf)
    }
}

fn tail_lines(path: &Path, count: usize) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    Ok(Some(lines[start..].join("\n")))
}

/// External analysis command.
///
/// Runs with `BENCH_RUN_DIR`, `BENCH_RUN_ID` and `BENCH_SCORE` (empty when
/// unscored) set; stdout is the artifact.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Analyzer for CommandAnalyzer {
    #[instrument(skip_all, fields(run_id = %request.result.run_id))]
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<String> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("analysis command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("BENCH_RUN_DIR", &request.paths.dir)
            .env("BENCH_RUN_ID", request.result.run_id.as_str())
            .env(
                "BENCH_SCORE",
                request
                    .result
                    .score()
                    .map(|score| score.value().to_string())
                    .unwrap_or_default(),
            );
        let output = run_command(cmd, RunOptions::new(self.timeout, self.output_limit_bytes))
            .context("run analysis command")?;
        if output.timed_out {
            bail!("analysis command timed out after {}s", self.timeout.as_secs());
        }
        if !output.success() {
            bail!(
                "analysis command failed (exit {:?}): {}",
                output.exit_code(),
                tail(&output.stderr_lossy(), 2000)
            );
        }
        debug!(bytes = output.stdout.len(), "analysis command finished");
        Ok(output.stdout_lossy())
    }
}
