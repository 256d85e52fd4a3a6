//! Descriptor loading from agent and task directory trees.
//!
//! Layout (one directory per descriptor, named after it):
//!
//! ```text
//! agents/<name>/agent.toml
//! agents/<name>/install.dockerfile
//! agents/<name>/command_template.txt
//!
//! tasks/<name>/task.toml
//! tasks/<name>/instructions.txt
//! tasks/<name>/test.py              (or [test] script)
//! tasks/<name>/setup.dockerfile     (optional)
//! tasks/<name>/test_commands.sh     (optional)
//! tasks/<name>/test_time_data/      (optional)
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::descriptor::{
    AgentDescriptor, DEFAULT_TEST_SCRIPT, Difficulty, TaskDescriptor, TestScript,
};
use crate::error::DescriptorError;

pub const AGENT_CONFIG_FILE: &str = "agent.toml";
pub const AGENT_INSTALL_FILE: &str = "install.dockerfile";
pub const AGENT_COMMAND_FILE: &str = "command_template.txt";

pub const TASK_CONFIG_FILE: &str = "task.toml";
pub const TASK_INSTRUCTIONS_FILE: &str = "instructions.txt";
pub const TASK_SETUP_FILE: &str = "setup.dockerfile";
pub const TASK_PRE_TEST_FILE: &str = "test_commands.sh";
pub const TASK_DATA_DIR: &str = "test_time_data";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:__|_|-+)[a-z0-9]+)*$")
        .unwrap_or_else(|err| panic!("name regex is invalid: {err}"))
});

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentFile {
    #[serde(default)]
    required_env_vars: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    #[serde(default)]
    required_env_vars: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    task_info: TaskInfo,
    #[serde(default)]
    test: TestSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskInfo {
    difficulty: Difficulty,
    non_deterministic_evals: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestSection {
    command: Option<Vec<String>>,
    script: Option<String>,
}

/// Load every agent under `dir`, sorted by name.
pub fn load_agents(dir: &Path) -> Result<Vec<Arc<AgentDescriptor>>, DescriptorError> {
    load_all(dir, "agent", AGENT_CONFIG_FILE, load_agent)
}

/// Load every task under `dir`, sorted by name.
pub fn load_tasks(dir: &Path) -> Result<Vec<Arc<TaskDescriptor>>, DescriptorError> {
    load_all(dir, "task", TASK_CONFIG_FILE, load_task)
}

fn load_all<D>(
    dir: &Path,
    kind: &'static str,
    config_file: &str,
    load_one: fn(&Path, String) -> Result<D>,
) -> Result<Vec<Arc<D>>, DescriptorError> {
    let wrap = |path: &Path, err: anyhow::Error| DescriptorError {
        kind,
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    };

    let mut dirs = descriptor_dirs(dir).map_err(|err| wrap(dir, err))?;
    dirs.sort();

    let mut loaded = Vec::with_capacity(dirs.len());
    for path in dirs {
        if !path.join(config_file).is_file() {
            warn!(kind, path = %path.display(), config_file, "skipping directory without config file");
            continue;
        }
        let descriptor = dir_name(&path)
            .and_then(|name| load_one(&path, name))
            .map_err(|err| wrap(&path, err))?;
        loaded.push(Arc::new(descriptor));
    }
    debug!(kind, count = loaded.len(), dir = %dir.display(), "loaded descriptors");
    Ok(loaded)
}

fn descriptor_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("descriptor directory not found");
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        if entry.file_type().context("read file type")?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn dir_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("directory name is not valid UTF-8"))?;
    validate_name(name)?;
    Ok(name.to_string())
}

fn load_agent(path: &Path, name: String) -> Result<AgentDescriptor> {
    let config: AgentFile = read_toml(&path.join(AGENT_CONFIG_FILE))?;
    validate_env_vars(&config.required_env_vars)?;
    validate_tags(&config.tags)?;

    let install_recipe = read_required(&path.join(AGENT_INSTALL_FILE))?;
    let command_template = read_required(&path.join(AGENT_COMMAND_FILE))?;
    if command_template.trim().is_empty() {
        bail!("{AGENT_COMMAND_FILE} must be non-empty");
    }

    Ok(AgentDescriptor {
        name,
        install_recipe,
        command_template,
        required_env_vars: config.required_env_vars,
        tags: config.tags,
    })
}

fn load_task(path: &Path, name: String) -> Result<TaskDescriptor> {
    let config: TaskFile = read_toml(&path.join(TASK_CONFIG_FILE))?;
    validate_env_vars(&config.required_env_vars)?;
    validate_tags(&config.tags)?;

    if let Some(command) = &config.test.command
        && (command.is_empty() || command[0].trim().is_empty())
    {
        bail!("test.command must be a non-empty array");
    }
    let script_name = config
        .test
        .script
        .unwrap_or_else(|| DEFAULT_TEST_SCRIPT.to_string());
    validate_file_name(&script_name).context("test.script")?;

    let instructions = read_required(&path.join(TASK_INSTRUCTIONS_FILE))?;
    if instructions.trim().is_empty() {
        bail!("{TASK_INSTRUCTIONS_FILE} must be non-empty");
    }

    let script_path = path.join(&script_name);
    let contents = fs::read(&script_path)
        .with_context(|| format!("read test script {}", script_path.display()))?;

    let data_dir = path.join(TASK_DATA_DIR);

    Ok(TaskDescriptor {
        name,
        difficulty: config.task_info.difficulty,
        non_deterministic: config.task_info.non_deterministic_evals,
        required_env_vars: config.required_env_vars,
        tags: config.tags,
        setup_recipe: read_optional(&path.join(TASK_SETUP_FILE))?,
        pre_test_script: read_optional(&path.join(TASK_PRE_TEST_FILE))?,
        test_script: TestScript {
            file_name: script_name,
            contents,
        },
        test_command: config.test.command,
        instructions,
        data_dir: data_dir.is_dir().then_some(data_dir),
    })
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn read_required(path: &Path) -> Result<String> {
    if !path.is_file() {
        bail!("missing required file {}", path.display());
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok((!contents.trim().is_empty()).then_some(contents))
}

/// Names end up inside image references, so they follow the reference
/// path-component grammar: alphanumeric runs joined by `_`, `__` or dashes.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must be non-empty");
    }
    if !NAME_RE.is_match(name) {
        bail!(
            "name {name:?} must be [a-z0-9] runs joined by '_', '__' or '-', \
             starting and ending with [a-z0-9]"
        );
    }
    Ok(())
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("file name must be non-empty");
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        bail!("file name {name:?} must not contain path separators");
    }
    Ok(())
}

fn validate_env_vars(vars: &[String]) -> Result<()> {
    for var in vars {
        let mut chars = var.chars();
        let valid_head = chars
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
        if !valid_head || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            bail!("required_env_vars entry {var:?} is not a valid variable name");
        }
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> Result<()> {
    if tags.iter().any(|tag| tag.trim().is_empty()) {
        bail!("tags must be non-empty strings");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    fn write_agent(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        write(
            &dir.join(AGENT_CONFIG_FILE),
            "required_env_vars = [\"ANTHROPIC_API_KEY\"]\ntags = [\"cli\"]\n",
        );
        write(&dir.join(AGENT_INSTALL_FILE), "RUN npm install -g agent\n");
        write(&dir.join(AGENT_COMMAND_FILE), "agent -p \"{{task_instructions}}\"\n");
        dir
    }

    fn write_task(root: &Path, name: &str, difficulty: &str) -> PathBuf {
        let dir = root.join(name);
        write(
            &dir.join(TASK_CONFIG_FILE),
            &format!(
                "tags = [\"go\"]\n\n[task_info]\ndifficulty = \"{difficulty}\"\nnon_deterministic_evals = false\n"
            ),
        );
        write(&dir.join(TASK_INSTRUCTIONS_FILE), "Build a calculator.\n");
        write(&dir.join(DEFAULT_TEST_SCRIPT), "print('ok')\n");
        dir
    }

    #[test]
    fn loads_agents_sorted_by_name() {
        let temp = TempDir::new().expect("tempdir");
        write_agent(temp.path(), "zeta");
        write_agent(temp.path(), "alpha");

        let agents = load_agents(temp.path()).expect("load");
        let names: Vec<&str> = agents.iter().map(|agent| agent.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(agents[0].required_env_vars, vec!["ANTHROPIC_API_KEY"]);
        assert!(agents[0].command_template.contains("task_instructions"));
    }

    #[test]
    fn skips_directories_without_config() {
        let temp = TempDir::new().expect("tempdir");
        write_agent(temp.path(), "real");
        fs::create_dir_all(temp.path().join("scratch")).expect("mkdir");

        let agents = load_agents(temp.path()).expect("load");
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn missing_required_file_is_descriptor_error() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_agent(temp.path(), "broken");
        fs::remove_file(dir.join(AGENT_COMMAND_FILE)).expect("remove");

        let err = load_agents(temp.path()).expect_err("missing file");
        assert_eq!(err.kind, "agent");
        assert!(err.reason.contains(AGENT_COMMAND_FILE));
    }

    #[test]
    fn rejects_unknown_keys() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_agent(temp.path(), "typo");
        write(&dir.join(AGENT_CONFIG_FILE), "required_env_var = [\"X\"]\n");

        assert!(load_agents(temp.path()).is_err());
    }

    #[test]
    fn rejects_invalid_names() {
        let temp = TempDir::new().expect("tempdir");
        write_agent(temp.path(), "Bad Name");

        let err = load_agents(temp.path()).expect_err("bad name");
        assert!(err.reason.contains("[a-z0-9]"));
    }

    #[test]
    fn rejects_names_with_dangling_or_mixed_separators() {
        for name in ["calc_", "-calc", "_calc", "calc-", "a_-b", "a-_b", "a___b"] {
            let temp = TempDir::new().expect("tempdir");
            write_task(temp.path(), name, "easy");

            let err = load_tasks(temp.path()).expect_err(name);
            assert!(err.reason.contains(name), "{name}: {}", err.reason);
        }
    }

    #[test]
    fn accepts_reference_safe_names() {
        let temp = TempDir::new().expect("tempdir");
        for name in ["calc-go", "calc_v2", "calc__v2", "calc--go", "2048"] {
            write_task(temp.path(), name, "easy");
        }

        let tasks = load_tasks(temp.path()).expect("tasks");
        let names: Vec<&str> = tasks.iter().map(|task| task.name.as_str()).collect();
        assert_eq!(names, vec!["2048", "calc--go", "calc-go", "calc__v2", "calc_v2"]);
    }

    #[test]
    fn loads_task_with_optional_parts() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_task(temp.path(), "calc-go", "hard");
        write(&dir.join(TASK_SETUP_FILE), "RUN apt-get install -y golang\n");
        write(&dir.join(TASK_PRE_TEST_FILE), "go build ./...\n");
        write(&dir.join(TASK_DATA_DIR).join("input.csv"), "a,b\n");

        let tasks = load_tasks(temp.path()).expect("load");
        let task = &tasks[0];
        assert_eq!(task.name, "calc-go");
        assert_eq!(task.difficulty, Difficulty::Hard);
        assert!(!task.non_deterministic);
        assert!(task.setup_recipe.is_some());
        assert!(task.pre_test_script.is_some());
        assert_eq!(task.test_script.file_name, DEFAULT_TEST_SCRIPT);
        assert_eq!(task.data_dir.as_deref(), Some(dir.join(TASK_DATA_DIR).as_path()));
        assert_eq!(task.test_command, None);
    }

    #[test]
    fn task_requires_task_info() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_task(temp.path(), "calc", "easy");
        write(&dir.join(TASK_CONFIG_FILE), "tags = []\n");

        let err = load_tasks(temp.path()).expect_err("missing task_info");
        assert_eq!(err.kind, "task");
    }

    #[test]
    fn task_rejects_unknown_difficulty() {
        let temp = TempDir::new().expect("tempdir");
        write_task(temp.path(), "calc", "extreme");

        assert!(load_tasks(temp.path()).is_err());
    }

    #[test]
    fn custom_test_script_and_command() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_task(temp.path(), "calc", "easy");
        write(
            &dir.join(TASK_CONFIG_FILE),
            "[task_info]\ndifficulty = \"easy\"\nnon_deterministic_evals = true\n\n[test]\nscript = \"check.sh\"\ncommand = [\"bash\", \"/project/check.sh\"]\n",
        );
        write(&dir.join("check.sh"), "exit 0\n");

        let tasks = load_tasks(temp.path()).expect("load");
        assert_eq!(tasks[0].test_script.file_name, "check.sh");
        assert!(tasks[0].non_deterministic);
        assert_eq!(
            tasks[0].resolved_test_command("/project"),
            vec!["bash", "/project/check.sh"]
        );
    }

    #[test]
    fn rejects_script_path_escape() {
        let temp = TempDir::new().expect("tempdir");
        let dir = write_task(temp.path(), "calc", "easy");
        write(
            &dir.join(TASK_CONFIG_FILE),
            "[task_info]\ndifficulty = \"easy\"\nnon_deterministic_evals = false\n\n[test]\nscript = \"../test.py\"\n",
        );

        assert!(load_tasks(temp.path()).is_err());
    }

    #[test]
    fn missing_root_is_error() {
        let temp = TempDir::new().expect("tempdir");
        assert!(load_tasks(&temp.path().join("nope")).is_err());
    }
}
