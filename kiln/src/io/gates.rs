//! Verification gates: configured shell commands run during verify.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::GateResult;
use crate::error::{PauseReason, PausedError};
use crate::events::{EngineEvent, EventSink};
use crate::io::config::PipelineSpec;
use crate::io::process::{CommandLimits, run_command};

/// Parameters for one gate command.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub name: String,
    pub command: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    /// Log path as recorded in the result (relative to the run directory).
    pub output_ref: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
}

/// Abstraction over gate execution so tests can script outcomes.
pub trait GateRunner {
    /// Run one gate. Cancellation must surface as [`PausedError`]; a failing
    /// or timed-out command is a failed result, not an error.
    fn run(&self, request: &GateRequest) -> Result<GateResult>;
}

/// Runs gate commands through `sh -c` with stderr merged into stdout.
pub struct ShellGateRunner;

impl GateRunner for ShellGateRunner {
    #[instrument(skip_all, fields(gate = %request.name))]
    fn run(&self, request: &GateRequest) -> Result<GateResult> {
        debug!(command = %request.command, "running gate");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", request.command))
            .current_dir(&request.workdir);

        let output = run_command(
            cmd,
            None,
            CommandLimits {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
            },
            &request.cancel,
            None,
        )
        .with_context(|| format!("run gate '{}'", request.name))?;

        let mut log = output.stdout_text();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        log.push_str(&output.truncated_notice(&request.name));
        if output.timed_out {
            log.push_str(&format!(
                "\n[gate timed out after {}s]\n",
                request.timeout.as_secs()
            ));
        }
        write_gate_log(&request.log_path, &log)?;

        if output.cancelled {
            return Err(PausedError {
                reason: PauseReason::Cancelled,
            }
            .into());
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let passed = !output.timed_out && output.status.success();
        if passed {
            info!(exit_code, "gate passed");
        } else {
            warn!(exit_code, timed_out = output.timed_out, "gate failed");
        }
        Ok(GateResult {
            name: request.name.clone(),
            command: request.command.clone(),
            exit_code,
            output_ref: request.output_ref.clone(),
            passed,
        })
    }
}

fn write_gate_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write gate log {}", path.display()))
}

/// Where and how the verify attempt runs its gates.
#[derive(Debug, Clone)]
pub struct GateContext<'a> {
    pub workdir: &'a Path,
    pub run_dir: &'a Path,
    pub gate_dir: &'a Path,
    pub cancel: &'a CancelToken,
    pub events: &'a EventSink,
}

/// Run every required gate sequentially, in configured order.
///
/// A required gate without a command is a configuration error.
#[instrument(skip_all, fields(gates = spec.gates.required_checks.len()))]
pub fn run_gates<G: GateRunner>(
    runner: &G,
    spec: &PipelineSpec,
    ctx: &GateContext<'_>,
) -> Result<Vec<GateResult>> {
    let mut results = Vec::with_capacity(spec.gates.required_checks.len());
    for name in &spec.gates.required_checks {
        if ctx.cancel.is_cancelled() {
            return Err(PausedError {
                reason: PauseReason::Cancelled,
            }
            .into());
        }
        let command = spec
            .commands
            .get(name)
            .ok_or_else(|| anyhow!("no command configured for gate '{name}'"))?;
        let log_path = ctx.gate_dir.join(format!("{name}.log"));
        let output_ref = log_path
            .strip_prefix(ctx.run_dir)
            .unwrap_or(&log_path)
            .display()
            .to_string();
        let request = GateRequest {
            name: name.clone(),
            command: command.clone(),
            workdir: ctx.workdir.to_path_buf(),
            log_path,
            output_ref,
            timeout: Duration::from_secs(spec.gates.timeout_secs),
            output_limit_bytes: spec.gates.output_limit_bytes,
            cancel: ctx.cancel.clone(),
        };
        let result = runner.run(&request)?;
        ctx.events.emit(EngineEvent::GateFinished(result.clone()));
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(commands: &[(&str, &str)]) -> PipelineSpec {
        let mut spec = PipelineSpec::default();
        for (name, command) in commands {
            spec.commands
                .insert((*name).to_string(), (*command).to_string());
            spec.gates.required_checks.push((*name).to_string());
        }
        spec
    }

    /// Gates run in order, each writing a combined log and recording its exit code.
    #[test]
    fn shell_gates_record_results_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = temp.path().join("run");
        let gate_dir = run_dir.join("verify/iter_1/gate_outputs");
        let spec = spec_with(&[
            ("build", "echo building; echo warn >&2"),
            ("unit_tests", "echo failing; exit 3"),
        ]);
        let (events, rx) = EventSink::channel();
        let cancel = CancelToken::new();

        let results = run_gates(
            &ShellGateRunner,
            &spec,
            &GateContext {
                workdir: temp.path(),
                run_dir: &run_dir,
                gate_dir: &gate_dir,
                cancel: &cancel,
                events: &events,
            },
        )
        .expect("run gates");

        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert_eq!(results[0].output_ref, "verify/iter_1/gate_outputs/build.log");
        assert!(!results[1].passed);
        assert_eq!(results[1].exit_code, 3);

        let build_log = fs::read_to_string(gate_dir.join("build.log")).expect("read log");
        assert!(build_log.contains("building"));
        assert!(build_log.contains("warn"));

        drop(events);
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn missing_gate_command_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = PipelineSpec::default();
        spec.gates.required_checks = vec!["lint".to_string()];
        let cancel = CancelToken::new();
        let events = EventSink::disabled();
        let err = run_gates(
            &ShellGateRunner,
            &spec,
            &GateContext {
                workdir: temp.path(),
                run_dir: temp.path(),
                gate_dir: temp.path(),
                cancel: &cancel,
                events: &events,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("gate 'lint'"));
    }

    #[test]
    fn cancelled_gate_run_pauses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = spec_with(&[("build", "true")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let events = EventSink::disabled();
        let err = run_gates(
            &ShellGateRunner,
            &spec,
            &GateContext {
                workdir: temp.path(),
                run_dir: temp.path(),
                gate_dir: temp.path(),
                cancel: &cancel,
                events: &events,
            },
        )
        .unwrap_err();
        assert!(err.downcast_ref::<PausedError>().is_some());
    }
}
