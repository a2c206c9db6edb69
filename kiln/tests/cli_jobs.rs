//! CLI tests for the job commands.
//!
//! Spawns the kiln binary and verifies exit codes for completed, paused,
//! failed and unknown jobs.

use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use kiln::core::types::JobStatus;
use kiln::exit_codes;
use kiln::io::config::PhaseDef;
use kiln::io::job_store::{list_jobs, load_job};
use kiln::test_support::TestProject;

fn kiln(project: &TestProject, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--root")
        .arg(project.root())
        .args(args)
        .output()
        .expect("spawn kiln")
}

/// Single-phase pipeline whose worker prints `reply` and ignores the prompt.
fn single_phase_project(reply: &str, timeout_secs: u64) -> TestProject {
    let project = TestProject::new();
    let script = format!("cat >/dev/null; {reply}");
    project.edit_spec(|spec| {
        spec.phases = vec![PhaseDef::new("context")];
        spec.worker.command = vec!["sh".to_string(), "-c".to_string(), script];
        spec.worker.timeout_secs = timeout_secs;
    });
    project
}

#[test]
fn init_refuses_existing_layout_without_force() {
    let project = TestProject::new();
    let again = kiln(&project, &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));

    let forced = kiln(&project, &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn run_completes_and_is_listed() {
    let project = single_phase_project(r#"echo '{"phase": "context", "summary": "ok"}'"#, 30);

    let run = kiln(&project, &["run", "describe", "the", "project"]);
    assert_eq!(
        run.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&run.stderr)
    );

    let jobs = list_jobs(&project.paths.agent_dir).expect("list");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].task, "describe the project");

    let listing = kiln(&project, &["jobs"]);
    assert_eq!(listing.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&listing.stdout);
    assert!(stdout.contains(&jobs[0].id));
    assert!(stdout.contains("completed"));

    let resume = kiln(&project, &["resume", &jobs[0].id]);
    assert_eq!(resume.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&resume.stdout).contains("already completed"));
}

#[test]
fn worker_timeout_pauses_the_run() {
    let project = single_phase_project("sleep 5", 1);

    let run = kiln(&project, &["run", "slow", "task"]);
    assert_eq!(run.status.code(), Some(exit_codes::PAUSED));

    let jobs = list_jobs(&project.paths.agent_dir).expect("list");
    let job = load_job(&project.paths.agent_dir, &jobs[0].id).expect("load");
    assert_eq!(job.status, JobStatus::Paused);
}

/// Background processes the worker started do not hold up the paused exit.
#[test]
fn worker_timeout_is_not_held_up_by_background_processes() {
    let project = single_phase_project("(sleep 25) & sleep 25", 1);

    let started = Instant::now();
    let run = kiln(&project, &["run", "spawns", "helpers"]);
    assert_eq!(run.status.code(), Some(exit_codes::PAUSED));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "took {:?}",
        started.elapsed()
    );
}

#[cfg(unix)]
#[test]
fn interrupt_pauses_the_run() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use wait_timeout::ChildExt;

    let project = single_phase_project("sleep 30", 60);
    let mut child = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--root")
        .arg(project.root())
        .args(["run", "long", "task"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn kiln");

    // The job record is written after the signal handler is in place.
    let waited = Instant::now();
    while list_jobs(&project.paths.agent_dir)
        .unwrap_or_default()
        .is_empty()
    {
        assert!(waited.elapsed() < Duration::from_secs(10), "job never started");
        thread::sleep(Duration::from_millis(50));
    }
    thread::sleep(Duration::from_millis(300));

    let pid = i32::try_from(child.id()).expect("pid");
    kill(Pid::from_raw(pid), Signal::SIGINT).expect("send SIGINT");
    let status = child
        .wait_timeout(Duration::from_secs(15))
        .expect("wait kiln")
        .expect("kiln exits after SIGINT");
    assert_eq!(status.code(), Some(exit_codes::PAUSED));

    let jobs = list_jobs(&project.paths.agent_dir).expect("list");
    assert_eq!(jobs[0].status, JobStatus::Paused);
}

#[test]
fn invalid_output_fails_the_run() {
    let project = single_phase_project("echo 'no structured output today'", 30);

    let run = kiln(&project, &["run", "broken", "task"]);
    assert_eq!(run.status.code(), Some(exit_codes::FAILED));

    let jobs = list_jobs(&project.paths.agent_dir).expect("list");
    assert_eq!(jobs[0].status, JobStatus::Failed);

    let resolve = kiln(&project, &["resolve", &jobs[0].id, "anything"]);
    assert_eq!(resolve.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&resolve.stderr).contains("not waiting at a checkpoint"));
}

#[test]
fn unknown_job_ids_exit_with_not_found() {
    let project = TestProject::new();
    for args in [
        ["resume", "20000101-000000"].as_slice(),
        ["resolve", "20000101-000000", "yes"].as_slice(),
        ["delete", "20000101-000000"].as_slice(),
    ] {
        let out = kiln(&project, args);
        assert_eq!(out.status.code(), Some(exit_codes::NOT_FOUND), "{args:?}");
    }
}

#[test]
fn delete_removes_the_job() {
    let project = single_phase_project(r#"echo '{"phase": "context"}'"#, 30);
    assert_eq!(
        kiln(&project, &["run", "short"]).status.code(),
        Some(exit_codes::OK)
    );
    let id = list_jobs(&project.paths.agent_dir).expect("list")[0].id.clone();

    let out = kiln(&project, &["delete", &id]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(list_jobs(&project.paths.agent_dir).expect("list").is_empty());
}
