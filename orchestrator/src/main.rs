//! Checkpoint orchestrator CLI.
//!
//! Operates on the `.orchestrator/` state directory under `--root`. Task
//! runs talk to the configured worker and reasoner endpoints.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use orchestrator::app::{Collaborators, Orchestrator};
use orchestrator::core::invariants::validate_task;
use orchestrator::core::selector::progress;
use orchestrator::exit_codes;
use orchestrator::io::config::load_config;
use orchestrator::io::paths::{StatePaths, init_state};
use orchestrator::logging;
use orchestrator::supervisor::{TaskRun, TaskRunState};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Checkpoint orchestrator for isolated AI worker sessions"
)]
struct Cli {
    /// Project root holding `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` and a default config if missing.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check config and every stored task against its invariants.
    Validate,
    /// Print tasks with checkpoint progress and the instance dashboard.
    Status,
    /// Create a draft from a file and validate it.
    Draft {
        file: PathBuf,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Break a validated draft down into a task.
    Breakdown { draft_id: String },
    /// Run a task's checkpoints in order.
    Run {
        task_id: String,
        /// Working directory handed to every worker session.
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
    /// Resume a paused task run.
    Resume { instance_id: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = StatePaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Validate => cmd_validate(&paths),
        Command::Status => cmd_status(&paths),
        Command::Draft { file, description } => cmd_draft(&paths, &file, &description),
        Command::Breakdown { draft_id } => block_on(cmd_breakdown(&paths, &draft_id)),
        Command::Run {
            task_id,
            working_dir,
        } => {
            let working_dir = working_dir.unwrap_or_else(|| paths.root.clone());
            block_on(cmd_run(&paths, &task_id, working_dir))
        }
        Command::Resume { instance_id } => block_on(cmd_resume(&paths, &instance_id)),
    }
}

fn block_on<F: std::future::Future<Output = Result<i32>>>(future: F) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("start async runtime")?;
    runtime.block_on(future)
}

fn open(paths: &StatePaths) -> Result<Orchestrator> {
    if !paths.state_dir.exists() {
        bail!(
            "{} does not exist; run `orchestrator init` first",
            paths.state_dir.display()
        );
    }
    let config = load_config(&paths.config_path)?;
    let collaborators = Collaborators::http(&config, paths)?;
    Orchestrator::open(paths, config, collaborators)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}

fn cmd_init(paths: &StatePaths, force: bool) -> Result<i32> {
    let wrote = init_state(paths, force)?;
    if wrote {
        println!("wrote {}", paths.config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &StatePaths) -> Result<i32> {
    let orch = open(paths)?;
    let mut violations = Vec::new();
    for task in orch.entities.list_tasks() {
        let checkpoints = orch.entities.task_checkpoints(&task.id)?;
        violations.extend(validate_task(&task, &checkpoints));
    }
    if !violations.is_empty() {
        bail!("invariant violations:\n- {}", violations.join("\n- "));
    }
    println!("ok");
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct TaskLine {
    id: String,
    name: String,
    status: &'static str,
    passed: usize,
    total: usize,
}

fn cmd_status(paths: &StatePaths) -> Result<i32> {
    let orch = open(paths)?;
    let mut tasks = Vec::new();
    for task in orch.entities.list_tasks() {
        let checkpoints = orch.entities.task_checkpoints(&task.id)?;
        let (passed, total) = progress(&checkpoints);
        tasks.push(TaskLine {
            id: task.id,
            name: task.name,
            status: task.status.as_str(),
            passed,
            total,
        });
    }
    print_json(&serde_json::json!({
        "tasks": tasks,
        "instances": orch.registry.dashboard(),
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_draft(paths: &StatePaths, file: &Path, description: &str) -> Result<i32> {
    let content =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let orch = open(paths)?;
    let draft = orch.entities.create_draft(&content, description)?;
    let validation = orch.entities.validate(&draft.id)?;
    print_json(&validation)?;
    Ok(if validation.passed {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

async fn cmd_breakdown(paths: &StatePaths, draft_id: &str) -> Result<i32> {
    let orch = open(paths)?;
    let task = orch.entities.breakdown(draft_id).await?;
    print_json(&task)?;
    Ok(exit_codes::OK)
}

async fn cmd_run(paths: &StatePaths, task_id: &str, working_dir: PathBuf) -> Result<i32> {
    let orch = open(paths)?;
    let run = orch.supervisor.run_task(task_id, working_dir).await?;
    report_run(&run)
}

async fn cmd_resume(paths: &StatePaths, instance_id: &str) -> Result<i32> {
    let orch = open(paths)?;
    orch.supervisor.resume(instance_id)?;
    let run = orch.supervisor.drive(instance_id).await?;
    report_run(&run)
}

fn report_run(run: &TaskRun) -> Result<i32> {
    print_json(run)?;
    Ok(run_exit_code(&run.state))
}

fn run_exit_code(state: &TaskRunState) -> i32 {
    match state {
        TaskRunState::Completed => exit_codes::OK,
        TaskRunState::Escalated { .. } => exit_codes::ESCALATED,
        TaskRunState::Blocked { .. } => exit_codes::BLOCKED,
        TaskRunState::Paused => exit_codes::PAUSED,
        TaskRunState::Stopped { .. } => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["orchestrator", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_run_with_root_and_working_dir() {
        let cli = Cli::parse_from([
            "orchestrator",
            "--root",
            "/tmp/project",
            "run",
            "task-1",
            "--working-dir",
            "/tmp/project/src",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
        let Command::Run {
            task_id,
            working_dir,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(task_id, "task-1");
        assert_eq!(working_dir, Some(PathBuf::from("/tmp/project/src")));
    }

    #[test]
    fn escalated_run_has_its_own_exit_code() {
        let state = TaskRunState::Escalated {
            checkpoint_id: "cp-1".to_string(),
            ticket_id: None,
        };
        assert_eq!(run_exit_code(&state), exit_codes::ESCALATED);
        assert_eq!(run_exit_code(&TaskRunState::Completed), exit_codes::OK);
    }

    #[test]
    fn status_requires_init() {
        let paths = StatePaths::new("/nonexistent/orchestrator-root");
        let err = cmd_status(&paths).err().expect("uninitialized state");
        assert!(format!("{err:#}").contains("orchestrator init"));
    }
}
