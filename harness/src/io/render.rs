//! Dockerfile and agent command rendering.

use std::fs;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};

use crate::core::descriptor::{AgentDescriptor, TaskDescriptor};
use crate::core::types::RunId;
use crate::io::config::RuntimeConfig;

const BASE_DOCKERFILE: &str = include_str!("templates/base.dockerfile");

/// Renders the per-run image definition and the agent invocation.
#[derive(Debug, Clone)]
pub struct Renderer {
    base_template: String,
    base_image: String,
    workdir: String,
}

impl Renderer {
    /// Build a renderer from runtime config, reading the template override if set.
    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self> {
        let base_template = match &runtime.base_template {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read base template {}", path.display()))?,
            None => BASE_DOCKERFILE.to_string(),
        };
        Ok(Self {
            base_template,
            base_image: runtime.base_image.clone(),
            workdir: runtime.workdir.clone(),
        })
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Base template + task setup recipe + agent install recipe.
    pub fn dockerfile(&self, agent: &AgentDescriptor, task: &TaskDescriptor) -> Result<String> {
        strict_env()
            .render_str(
                &self.base_template,
                context! {
                    base_image => self.base_image.as_str(),
                    agent_installation => agent.install_recipe.trim(),
                    task_installation => task.setup_recipe.as_deref().map(str::trim).unwrap_or(""),
                    workdir => self.workdir.as_str(),
                },
            )
            .context("render base dockerfile")
    }

    /// Agent command with the task instructions substituted.
    pub fn agent_command(
        &self,
        agent: &AgentDescriptor,
        task: &TaskDescriptor,
        run_id: &RunId,
    ) -> Result<String> {
        let rendered = strict_env()
            .render_str(
                &agent.command_template,
                context! {
                    task_instructions => task.instructions.trim(),
                    task_name => task.name.as_str(),
                    agent_name => agent.name.as_str(),
                    run_id => run_id.as_str(),
                },
            )
            .with_context(|| format!("render command template of agent {}", agent.name))?;
        Ok(rendered.trim().to_string())
    }
}

/// Undefined variables are errors so template typos surface as run failures.
fn strict_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::Difficulty;
    use crate::test_support::{agent, task};

    fn renderer() -> Renderer {
        Renderer::from_config(&RuntimeConfig::default()).expect("renderer")
    }

    #[test]
    fn dockerfile_includes_recipes_in_order() {
        let mut agent = agent("claude");
        agent.install_recipe = "RUN npm install -g claude".to_string();
        let mut task = task("calc", Difficulty::Easy);
        task.setup_recipe = Some("RUN apt-get install -y golang".to_string());

        let dockerfile = renderer().dockerfile(&agent, &task).expect("render");
        assert!(dockerfile.starts_with("FROM ubuntu:24.04"));
        let setup = dockerfile.find("golang").expect("setup recipe");
        let install = dockerfile.find("npm install").expect("install recipe");
        assert!(setup < install);
        assert!(dockerfile.contains("WORKDIR /project"));
    }

    #[test]
    fn dockerfile_without_setup_recipe() {
        let dockerfile = renderer()
            .dockerfile(&agent("claude"), &task("calc", Difficulty::Easy))
            .expect("render");
        assert!(!dockerfile.contains("# task setup"));
    }

    #[test]
    fn base_template_override_is_used() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("base.dockerfile");
        fs::write(&path, "FROM {{ base_image }}\n{{ agent_installation }}\n").expect("write");
        let runtime = RuntimeConfig {
            base_template: Some(path),
            base_image: "debian:12".to_string(),
            ..RuntimeConfig::default()
        };
        let renderer = Renderer::from_config(&runtime).expect("renderer");
        let mut agent = agent("a");
        agent.install_recipe = "RUN true".to_string();
        let dockerfile = renderer
            .dockerfile(&agent, &task("t", Difficulty::Easy))
            .expect("render");
        assert_eq!(dockerfile.trim(), "FROM debian:12\nRUN true");
    }

    #[test]
    fn command_substitutes_instructions() {
        let mut agent = agent("claude");
        agent.command_template = "claude -p \"{{ task_instructions }}\" --name {{ task_name }}".to_string();
        let mut task = task("calc", Difficulty::Easy);
        task.instructions = "Build a calculator.\n".to_string();
        let run_id = RunId::parse("claude.calc.t1.abcdef").expect("run id");

        let command = renderer().agent_command(&agent, &task, &run_id).expect("render");
        assert_eq!(command, "claude -p \"Build a calculator.\" --name calc");
    }

    #[test]
    fn unknown_template_variable_is_error() {
        let mut agent = agent("claude");
        agent.command_template = "claude {{ prompt }}".to_string();
        let run_id = RunId::parse("r1").expect("run id");
        assert!(
            renderer()
                .agent_command(&agent, &task("calc", Difficulty::Easy), &run_id)
                .is_err()
        );
    }
}
