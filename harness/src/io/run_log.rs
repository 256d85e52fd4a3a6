//! On-disk layout of a batch and its per-run artifacts.
//!
//! ```text
//! <runs_dir>/<batch_id>/plan.json
//! <runs_dir>/<batch_id>/reports/<agent>.json
//! <runs_dir>/<batch_id>/<run_id>/{build,agent_output,pre_test_output,test_output,container}.log
//! <runs_dir>/<batch_id>/<run_id>/{test_results,result}.json
//! <runs_dir>/<batch_id>/<run_id>/analysis.md
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use walkdir::WalkDir;

use crate::core::types::RunId;

pub const PLAN_FILE: &str = "plan.json";
pub const REPORTS_DIR: &str = "reports";
pub const RESULT_FILE: &str = "result.json";
pub const ANALYSIS_FILE: &str = "analysis.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub reports_dir: PathBuf,
}

impl BatchPaths {
    pub fn new(runs_dir: &Path, batch_id: &str) -> Self {
        Self::from_dir(&runs_dir.join(batch_id))
    }

    /// Batch identifier: the final component of the batch directory.
    pub fn id(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            plan_path: dir.join(PLAN_FILE),
            reports_dir: dir.join(REPORTS_DIR),
        }
    }

    pub fn run(&self, run_id: &RunId) -> RunPaths {
        RunPaths::new(&self.dir, run_id)
    }

    pub fn report_path(&self, agent: &str) -> PathBuf {
        self.reports_dir.join(format!("{agent}.json"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub build_log: PathBuf,
    pub agent_log: PathBuf,
    pub pre_test_log: PathBuf,
    pub test_log: PathBuf,
    pub container_log: PathBuf,
    pub test_results: PathBuf,
    pub result: PathBuf,
    pub analysis: PathBuf,
}

impl RunPaths {
    pub fn new(batch_dir: &Path, run_id: &RunId) -> Self {
        let dir = batch_dir.join(run_id.as_str());
        Self {
            build_log: dir.join("build.log"),
            agent_log: dir.join("agent_output.log"),
            pre_test_log: dir.join("pre_test_output.log"),
            test_log: dir.join("test_output.log"),
            container_log: dir.join("container.log"),
            test_results: dir.join("test_results.json"),
            result: dir.join(RESULT_FILE),
            analysis: dir.join(ANALYSIS_FILE),
            dir,
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create run dir {}", self.dir.display()))
    }
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn append_text(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}

/// Copy the contents of `src` into `dst`, creating directories as needed.
/// Symlinks are not followed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("missing directory {}", src.display());
    }
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
