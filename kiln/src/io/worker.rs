//! Worker abstraction for model invocation.
//!
//! The [`Worker`] trait decouples phase execution from the actual model
//! backend (a CLI such as `claude -p`). Tests use scripted workers that
//! return predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{PauseReason, PausedError};
use crate::events::{EngineEvent, EventSink};
use crate::io::process::{CommandLimits, CommandOutput, LineHandler, run_command};

/// Parameters for a worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// Program and arguments to run.
    pub command: Vec<String>,
    /// Phase the call belongs to (used to tag output events).
    pub phase: String,
    /// Prompt text fed to the worker on stdin.
    pub prompt: String,
    /// Working directory for the worker process (the repository root).
    pub workdir: PathBuf,
    /// Maximum wall clock time before the call is treated as paused.
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept; the rest is counted and dropped.
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
    pub events: EventSink,
    /// Path to write the worker's stdout/stderr log.
    pub log_path: PathBuf,
}

/// Abstraction over worker backends.
pub trait Worker {
    /// Run the worker and return its raw stdout.
    ///
    /// Cancellation and timeouts must surface as [`PausedError`]; anything
    /// else is a fatal error.
    fn invoke(&self, request: &WorkerRequest) -> Result<String>;
}

/// Worker that spawns a model CLI (`claude -p` by default) and feeds it the
/// prompt on stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeWorker;

impl Worker for ClaudeWorker {
    #[instrument(skip_all, fields(phase = %request.phase, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &WorkerRequest) -> Result<String> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting worker");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        // A reader abandoned after a kill keeps the handler alive; emptying
        // the slot afterwards still lets the event channel close.
        let sink = Arc::new(Mutex::new(Some(request.events.clone())));
        let handler_sink = Arc::clone(&sink);
        let phase = request.phase.clone();
        let on_line: LineHandler = Arc::new(move |stream, line| {
            if let Ok(slot) = handler_sink.lock()
                && let Some(events) = slot.as_ref()
            {
                events.emit(EngineEvent::Output {
                    phase: phase.clone(),
                    stream,
                    line: line.to_string(),
                });
            }
        });

        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            CommandLimits {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
            },
            &request.cancel,
            Some(on_line),
        );
        if let Ok(mut slot) = sink.lock() {
            slot.take();
        }
        let output = output.with_context(|| format!("run worker {program}"))?;

        write_worker_log(&request.log_path, &output)?;

        if output.cancelled {
            warn!("worker cancelled");
            return Err(PausedError {
                reason: PauseReason::Cancelled,
            }
            .into());
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "worker timed out");
            return Err(PausedError {
                reason: PauseReason::TimedOut,
            }
            .into());
        }
        // Some model CLIs exit non-zero after producing usable output.
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "worker exited non-zero");
        }

        debug!(bytes = output.stdout.len(), "worker completed");
        Ok(output.stdout_text())
    }
}

fn write_worker_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create worker log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.truncated_notice("worker"));
    if output.timed_out {
        buf.push_str("\n[worker timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[worker cancelled]\n");
    }
    fs::write(path, buf).with_context(|| format!("write worker log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::StreamKind;
    use std::sync::mpsc::RecvTimeoutError;

    fn request(
        command: &[&str],
        dir: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> (WorkerRequest, std::sync::mpsc::Receiver<EngineEvent>) {
        let (events, rx) = EventSink::channel();
        (
            WorkerRequest {
                command: command.iter().map(|part| (*part).to_string()).collect(),
                phase: "plan".to_string(),
                prompt: prompt.to_string(),
                workdir: dir.to_path_buf(),
                timeout,
                output_limit_bytes: 10_000,
                cancel: CancelToken::new(),
                events,
                log_path: dir.join("plan/iter_1/worker.log"),
            },
            rx,
        )
    }

    /// The prompt goes to stdin; stdout comes back and every line is an event.
    #[test]
    fn worker_echoes_prompt_and_streams_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, rx) = request(
            &["cat"],
            temp.path(),
            "line one\nline two\n",
            Duration::from_secs(10),
        );

        let output = ClaudeWorker.invoke(&req).expect("invoke");
        assert_eq!(output, "line one\nline two\n");
        drop(req);

        let lines: Vec<String> = rx
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Output {
                    stream: StreamKind::Stdout,
                    line,
                    ..
                } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["line one", "line two"]);

        let log = fs::read_to_string(temp.path().join("plan/iter_1/worker.log")).expect("log");
        assert!(log.starts_with("=== stdout ===\nline one"));
    }

    #[test]
    fn non_zero_exit_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, _rx) = request(
            &["sh", "-c", "echo partial; exit 2"],
            temp.path(),
            "",
            Duration::from_secs(10),
        );
        assert_eq!(ClaudeWorker.invoke(&req).expect("invoke"), "partial\n");
    }

    #[test]
    fn timeout_is_a_pause() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, _rx) = request(&["sleep", "5"], temp.path(), "", Duration::from_millis(200));
        let err = ClaudeWorker.invoke(&req).unwrap_err();
        let paused = err.downcast_ref::<PausedError>().expect("paused");
        assert_eq!(paused.reason, PauseReason::TimedOut);
    }

    #[test]
    fn cancellation_is_a_pause() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, _rx) = request(&["sleep", "5"], temp.path(), "", Duration::from_secs(10));
        req.cancel.cancel();
        let err = ClaudeWorker.invoke(&req).unwrap_err();
        let paused = err.downcast_ref::<PausedError>().expect("paused");
        assert_eq!(paused.reason, PauseReason::Cancelled);
    }

    /// The channel closes once the call returns, even when the killed worker
    /// had started background processes of its own.
    #[test]
    fn timed_out_worker_releases_the_event_channel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, rx) = request(
            &["sh", "-c", "cat >/dev/null; (sleep 20) & sleep 20"],
            temp.path(),
            "prompt",
            Duration::from_millis(300),
        );
        let err = ClaudeWorker.invoke(&req).unwrap_err();
        assert!(err.downcast_ref::<PausedError>().is_some());
        drop(req);

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (req, _rx) = request(&[], temp.path(), "", Duration::from_secs(1));
        let err = ClaudeWorker.invoke(&req).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
