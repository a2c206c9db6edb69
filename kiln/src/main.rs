//! Multi-phase AI worker orchestration.
//!
//! `kiln run` drives a task through context, plan, implement, verify and
//! deliver; jobs are stored under `.kiln/runs/` and can be listed, resumed,
//! resolved at a checkpoint or deleted.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln::cancel::{CancelToken, cancel_on_signals};
use kiln::core::types::JobStatus;
use kiln::engine::RunOutcome;
use kiln::error::JobNotFound;
use kiln::events::{EngineEvent, EventSink};
use kiln::exit_codes;
use kiln::io::gates::ShellGateRunner;
use kiln::io::init::{InitOptions, KilnPaths, init_kiln};
use kiln::io::job_store::{delete_job, list_jobs, resolve_checkpoint};
use kiln::io::process::StreamKind;
use kiln::io::worker::ClaudeWorker;
use kiln::logging;
use kiln::session::{JobRun, ResumeOutcome, Runtime, resume_job, start_job};

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Multi-phase AI worker orchestration with checkpoints and resume"
)]
struct Cli {
    /// Project root containing `.kiln/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.kiln/` with the default spec, prompts and schemas.
    Init {
        /// Overwrite existing defaults (job records are kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Start a job for the given task.
    Run {
        #[arg(required = true, trailing_var_arg = true)]
        task: Vec<String>,
    },
    /// List jobs, newest first.
    Jobs,
    /// Continue a paused, failed or resolved job.
    Resume { id: String },
    /// Answer the pending checkpoint of a job.
    Resolve {
        id: String,
        #[arg(required = true, trailing_var_arg = true)]
        resolution: Vec<String>,
    },
    /// Remove a job and its artifacts.
    Delete { id: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            if err.downcast_ref::<JobNotFound>().is_some() {
                exit_codes::NOT_FOUND
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = fs::canonicalize(&cli.root)
        .with_context(|| format!("resolve project root {}", cli.root.display()))?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run { task } => cmd_run(&KilnPaths::new(root), &task.join(" ")),
        Command::Jobs => cmd_jobs(&KilnPaths::new(root)),
        Command::Resume { id } => cmd_resume(&KilnPaths::new(root), &id),
        Command::Resolve { id, resolution } => {
            cmd_resolve(&KilnPaths::new(root), &id, &resolution.join(" "))
        }
        Command::Delete { id } => cmd_delete(&KilnPaths::new(root), &id),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_kiln(root, &InitOptions { force })?;
    println!("init: {}", paths.agent_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &KilnPaths, task: &str) -> Result<i32> {
    let cancel = interruptible()?;
    let run = with_event_printer(|events| {
        let runtime = Runtime {
            worker: &ClaudeWorker,
            gates: &ShellGateRunner,
            events,
            cancel,
        };
        start_job(paths, task, &runtime)
    })?;
    report_run(run)
}

fn cmd_resume(paths: &KilnPaths, id: &str) -> Result<i32> {
    let cancel = interruptible()?;
    let outcome = with_event_printer(|events| {
        let runtime = Runtime {
            worker: &ClaudeWorker,
            gates: &ShellGateRunner,
            events,
            cancel,
        };
        resume_job(paths, id, &runtime)
    })?;
    match outcome {
        ResumeOutcome::AlreadyCompleted(job) => {
            println!("job {} already completed", job.id);
            Ok(exit_codes::OK)
        }
        ResumeOutcome::Ran(run) => report_run(run),
    }
}

fn cmd_jobs(paths: &KilnPaths) -> Result<i32> {
    let jobs = list_jobs(&paths.agent_dir)?;
    if jobs.is_empty() {
        println!("no jobs");
    }
    for job in jobs {
        println!(
            "{} {}  {:<10}  {}  {}",
            status_icon(job.status),
            job.id,
            job.status.as_str(),
            job.project_name,
            job.task
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_resolve(paths: &KilnPaths, id: &str, resolution: &str) -> Result<i32> {
    let job = resolve_checkpoint(&paths.agent_dir, id, resolution)?;
    println!(
        "resolved checkpoint of job {}; run `kiln resume {}` to continue",
        job.id, job.id
    );
    Ok(exit_codes::OK)
}

fn cmd_delete(paths: &KilnPaths, id: &str) -> Result<i32> {
    delete_job(&paths.agent_dir, id)?;
    println!("deleted job {id}");
    Ok(exit_codes::OK)
}

/// Token cancelled by SIGINT or SIGTERM.
fn interruptible() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    cancel_on_signals(cancel.clone())?;
    Ok(cancel)
}

/// Run `f` with an event sink whose events are printed on a separate thread.
///
/// Every clone of the sink is dropped by the time `f` returns, which ends
/// the printer.
fn with_event_printer<T>(f: impl FnOnce(EventSink) -> T) -> T {
    let (events, rx) = EventSink::channel();
    let printer = thread::spawn(move || {
        for event in rx {
            render_event(&event);
        }
    });
    let result = f(events);
    if printer.join().is_err() {
        eprintln!("warning: event printer panicked");
    }
    result
}

fn report_run(run: JobRun) -> Result<i32> {
    let JobRun { job, outcome } = run;
    let outcome = outcome.with_context(|| format!("job {} failed", job.id))?;
    let code = match outcome {
        RunOutcome::Completed => {
            println!("job {} completed", job.id);
            exit_codes::OK
        }
        RunOutcome::Paused(reason) => {
            println!(
                "job {} paused ({reason}); continue with `kiln resume {}`",
                job.id, job.id
            );
            exit_codes::PAUSED
        }
        RunOutcome::Checkpoint(checkpoint) => {
            println!(
                "job {} is waiting at a checkpoint: {}\nanswer with `kiln resolve {} <resolution>`, then `kiln resume {}`",
                job.id, checkpoint.message, job.id, job.id
            );
            exit_codes::CHECKPOINT
        }
    };
    Ok(code)
}

fn render_event(event: &EngineEvent) {
    match event {
        EngineEvent::PhaseStarted {
            phase,
            iteration,
            resumed,
            ..
        } => {
            let note = if *resumed { ", resumed" } else { "" };
            println!("▶ {phase} (iteration {iteration}{note})");
        }
        EngineEvent::PhaseFinished { phase, status, .. } => {
            println!("  {phase}: {}", status.as_str());
        }
        EngineEvent::Output { stream, line, .. } => match stream {
            StreamKind::Stdout => println!("  │ {line}"),
            StreamKind::Stderr => eprintln!("  │ {line}"),
        },
        EngineEvent::Narration { text, .. } => println!("  » {text}"),
        EngineEvent::ChunkStarted {
            index,
            total,
            step_ids,
        } => {
            println!("  chunk {}/{}: {}", index + 1, total, step_ids.join(", "));
        }
        EngineEvent::FileApplied { path, action } => {
            println!("  {} {path}", action.as_str());
        }
        EngineEvent::GateFinished(gate) => {
            let verdict = if gate.passed { "pass" } else { "FAIL" };
            println!("  gate {}: {verdict} (exit {})", gate.name, gate.exit_code);
        }
        EngineEvent::Verification { summary, failures } => {
            println!("  {summary}");
            for check in failures {
                println!(
                    "    [{}] {}: {}",
                    check.category.as_str(),
                    check.file,
                    check.detail
                );
            }
        }
        EngineEvent::Checkpoint(checkpoint) => {
            println!(
                "⏸ checkpoint [{}] {}",
                checkpoint.kind.as_str(),
                checkpoint.message
            );
            for option in &checkpoint.options {
                println!("    - {option}");
            }
        }
        EngineEvent::LoopBack { from, to } => println!("↺ {from} failed, back to {to}"),
    }
}

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Discovery => "…",
        JobStatus::Running => "▶",
        JobStatus::Paused => "⏸",
        JobStatus::Checkpoint => "?",
        JobStatus::Completed => "✓",
        JobStatus::Failed => "✗",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["kiln", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_init_force_with_root() {
        let cli = Cli::parse_from(["kiln", "--root", "/tmp/project", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
    }

    #[test]
    fn parse_run_joins_task_words() {
        let cli = Cli::parse_from(["kiln", "run", "add", "a", "health", "endpoint"]);
        match cli.command {
            Command::Run { task } => assert_eq!(task.join(" "), "add a health endpoint"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_requires_task() {
        assert!(Cli::try_parse_from(["kiln", "run"]).is_err());
    }

    #[test]
    fn parse_resolve() {
        let cli = Cli::parse_from(["kiln", "resolve", "20260101-120000", "use", "sqlite"]);
        match cli.command {
            Command::Resolve { id, resolution } => {
                assert_eq!(id, "20260101-120000");
                assert_eq!(resolution, vec!["use", "sqlite"]);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn parse_root_after_subcommand() {
        let cli = Cli::parse_from(["kiln", "jobs", "--root", "/srv/app"]);
        assert!(matches!(cli.command, Command::Jobs));
        assert_eq!(cli.root, PathBuf::from("/srv/app"));
    }

    #[test]
    fn every_status_has_an_icon() {
        for status in [
            JobStatus::Discovery,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Checkpoint,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert!(!status_icon(status).is_empty());
        }
    }
}
