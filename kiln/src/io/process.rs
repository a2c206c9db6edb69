//! Helpers for running child processes with timeouts, cancellation and
//! bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often the wait loop wakes up to check for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for output readers after killing a child. Grandchildren
/// that inherited the pipes can keep them open past the kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Callback invoked from the reader threads for every output line
/// (without the trailing newline).
pub type LineHandler = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Run a command with a timeout and cancellation, capturing stdout/stderr
/// without risking pipe deadlocks.
///
/// Both streams are read line by line on their own threads while the child
/// runs; each line is passed to `on_line` as it arrives. Timeout and
/// cancellation kill the child and are reported through the output flags,
/// not as errors.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: CommandLimits,
    cancel: &CancelToken,
    on_line: Option<LineHandler>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group, so a kill also reaches anything the child started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handler = on_line.clone();
    let stdout_handle: ReaderHandle = thread::spawn(move || {
        read_lines_limited(stdout, limit, StreamKind::Stdout, stdout_handler)
    });
    let stderr_handle: ReaderHandle =
        thread::spawn(move || read_lines_limited(stderr, limit, StreamKind::Stderr, on_line));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let data = input.to_vec();
            Some(thread::spawn(move || child_stdin.write_all(&data)))
        }
        None => None,
    };

    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_group(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
            kill_group(&mut child)?;
            break child.wait().context("wait command after kill")?;
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            // The child may exit without reading all of its input.
            Ok(Err(err)) => debug!(err = %err, "stdin write did not complete"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }

    let killed = timed_out || cancelled;
    let (stdout, stdout_truncated) = join_output(stdout_handle, killed).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, killed).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// SIGKILL the child's process group, then the child itself in case the
/// group is already gone.
fn kill_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pid) => {
                if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                    debug!(err = %err, "killpg failed");
                }
            }
            Err(_) => debug!(pid = child.id(), "pid out of range for killpg"),
        }
    }
    child.kill().context("kill command")
}

fn join_output(handle: ReaderHandle, killed: bool) -> Result<(Vec<u8>, usize)> {
    if killed {
        let waited = Instant::now();
        while !handle.is_finished() && waited.elapsed() < KILL_GRACE {
            thread::sleep(POLL_INTERVAL);
        }
        if !handle.is_finished() {
            warn!("output reader still blocked after kill, abandoning it");
            return Ok((Vec::new(), 0));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    kind: StreamKind,
    on_line: Option<LineHandler>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(handler) = &on_line {
            let text = String::from_utf8_lossy(&line);
            handler(kind, text.trim_end_matches(['\n', '\r']));
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn limits(timeout_secs: u64, output_limit_bytes: usize) -> CommandLimits {
        CommandLimits {
            timeout: Duration::from_secs(timeout_secs),
            output_limit_bytes,
        }
    }

    #[test]
    fn captures_stdin_round_trip_and_lines() {
        let seen: Arc<Mutex<Vec<(StreamKind, String)>>> = Arc::default();
        let sink = seen.clone();
        let handler: LineHandler = Arc::new(move |kind, line| {
            sink.lock().expect("lock").push((kind, line.to_string()));
        });

        let output = run_command(
            Command::new("cat"),
            Some(b"one\ntwo\n"),
            limits(10, 1_000),
            &CancelToken::new(),
            Some(handler),
        )
        .expect("run cat");

        assert!(output.status.success());
        assert_eq!(output.stdout_text(), "one\ntwo\n");
        let seen = seen.lock().expect("lock");
        assert_eq!(
            *seen,
            vec![
                (StreamKind::Stdout, "one".to_string()),
                (StreamKind::Stdout, "two".to_string())
            ]
        );
    }

    #[test]
    fn output_beyond_limit_is_counted() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'abcdefghij'");
        let output = run_command(cmd, None, limits(10, 4), &CancelToken::new(), None)
            .expect("run printf");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.truncated_notice("gate").contains("truncated 6 bytes"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_command(
            cmd,
            None,
            CommandLimits {
                timeout: Duration::from_millis(200),
                output_limit_bytes: 100,
            },
            &CancelToken::new(),
            None,
        )
        .expect("run sleep");
        assert!(output.timed_out);
        assert!(!output.cancelled);
        assert!(!output.status.success());
    }

    #[test]
    fn cancellation_kills_the_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let output = run_command(cmd, None, limits(30, 100), &cancel, None).expect("run sleep");
        canceller.join().expect("join canceller");

        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    /// Background processes holding the output pipes die with the child, so
    /// the readers finish instead of waiting out the kill grace period.
    #[test]
    fn timeout_kills_background_grandchildren() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo started; (sleep 20) & sleep 20");
        let started = Instant::now();
        let output = run_command(
            cmd,
            None,
            CommandLimits {
                timeout: Duration::from_millis(300),
                output_limit_bytes: 100,
            },
            &CancelToken::new(),
            None,
        )
        .expect("run sh");

        assert!(output.timed_out);
        assert_eq!(output.stdout_text(), "started\n");
        assert!(started.elapsed() < KILL_GRACE, "took {:?}", started.elapsed());
    }
}
