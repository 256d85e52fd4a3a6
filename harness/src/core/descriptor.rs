//! Immutable in-memory descriptors for agents and tasks.
//!
//! Descriptors are built once by the loader (`io::loader`) and shared
//! read-only across workers behind `Arc`. Nothing in the crate mutates them
//! after construction.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default test script file name inside a task directory.
pub const DEFAULT_TEST_SCRIPT: &str = "test.py";

/// Task difficulty. Ordered: `Easy < Medium < Hard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty {other:?} (expected easy|medium|hard)")),
        }
    }
}

/// An agent definition: how to install it and how to invoke it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    /// Identity; the agent directory name.
    pub name: String,
    /// Dockerfile fragment that installs the agent on top of the base image.
    pub install_recipe: String,
    /// Command template rendered with the task instructions.
    pub command_template: String,
    /// Variables that must be present in the harness environment.
    pub required_env_vars: Vec<String>,
    pub tags: Vec<String>,
}

/// A task definition: environment setup, instructions and the test contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Identity; the task directory name.
    pub name: String,
    pub difficulty: Difficulty,
    /// Task opted into non-deterministic (e.g. LLM-graded) evaluation.
    pub non_deterministic: bool,
    pub required_env_vars: Vec<String>,
    pub tags: Vec<String>,
    /// Optional Dockerfile fragment applied before the agent install recipe.
    pub setup_recipe: Option<String>,
    /// Optional script executed before the test step.
    pub pre_test_script: Option<String>,
    /// Test script contents and the file name it is injected under.
    pub test_script: TestScript,
    /// Explicit test command; `None` means the standard `uv run` form.
    pub test_command: Option<Vec<String>>,
    pub instructions: String,
    /// Host directory copied verbatim into the environment working directory.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScript {
    pub file_name: String,
    pub contents: Vec<u8>,
}

impl TaskDescriptor {
    /// Test command to execute inside the environment working directory.
    pub fn resolved_test_command(&self, workdir: &str) -> Vec<String> {
        match &self.test_command {
            Some(command) => command.clone(),
            None => vec![
                "uv".to_string(),
                "run".to_string(),
                "--no-project".to_string(),
                format!("{}/{}", workdir.trim_end_matches('/'), self.test_script.file_name),
            ],
        }
    }
}

/// Union of the variables required by an agent/task pair, sorted and deduplicated.
pub fn required_env_vars(agent: &AgentDescriptor, task: &TaskDescriptor) -> Vec<String> {
    let mut vars: Vec<String> = agent
        .required_env_vars
        .iter()
        .chain(task.required_env_vars.iter())
        .cloned()
        .collect();
    vars.sort();
    vars.dedup();
    vars
}
