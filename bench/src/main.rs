mod cli;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use harness::{exit_codes, logging};

use crate::config::RunOverrides;

#[derive(Parser)]
#[command(name = "bench", version, about = "Benchmark harness for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the selected agent × task pairs without running anything.
    List {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Run every selected pair in its own container and write a batch.
    Run {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,
        #[arg(long, default_value = "bench.toml")]
        config: PathBuf,
        /// Maximum number of runs executing at once.
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Per-run budget in seconds.
        #[arg(long = "timeout", value_name = "SECS")]
        timeout_secs: Option<u64>,
        #[arg(long)]
        trials: Option<u32>,
    },
    /// Rebuild the agent reports of a stored batch.
    Report {
        batch_dir: PathBuf,
        #[arg(long, default_value = "bench.toml")]
        config: PathBuf,
    },
    /// Remove containers and images left behind by an interrupted run.
    Clean {
        #[arg(long, default_value = "bench.toml")]
        config: PathBuf,
    },
}

/// Descriptor locations and filters shared by `list` and `run`.
#[derive(Args, Debug, Clone)]
pub struct SelectionArgs {
    #[arg(long, default_value = "agents")]
    pub agents_dir: PathBuf,
    #[arg(long, default_value = "tasks")]
    pub tasks_dir: PathBuf,
    /// Agent predicate `key=value` or `key!=value`; repeatable.
    #[arg(long = "agent-filter", value_name = "PREDICATE")]
    pub agent_filters: Vec<String>,
    /// Task predicate `key=value` or `key!=value`; repeatable.
    #[arg(long = "task-filter", value_name = "PREDICATE")]
    pub task_filters: Vec<String>,
}

fn main() {
    logging::init("info");
    let cli = Cli::parse();
    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::List { selection } => cli::list(&selection),
        Command::Run {
            selection,
            runs_dir,
            config,
            max_parallel,
            timeout_secs,
            trials,
        } => cli::run(
            &selection,
            &runs_dir,
            &config,
            &RunOverrides {
                max_parallel,
                timeout_secs,
                trials,
            },
        ),
        Command::Report { batch_dir, config } => cli::report(&batch_dir, &config),
        Command::Clean { config } => cli::clean(&config),
    }
}
