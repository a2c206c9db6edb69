//! Durable job records under `.kiln/runs/<id>/state.json`.
//!
//! A job record is the run state plus identity and lifecycle status. It is
//! rewritten atomically after every phase and chunk transition, which is
//! what makes pause/resume and crash recovery possible.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::JobStatus;
use crate::error::JobNotFound;
use crate::io::artifacts::{AttemptPaths, write_json, write_text};
use crate::io::config::PipelineSpec;
use crate::state::RunState;

const STATE_FILE: &str = "state.json";
const TASK_FILE: &str = "task.txt";
const SUMMARY_TASK_CHARS: usize = 60;

/// Everything needed to list, resume or inspect a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub id: String,
    pub project_name: String,
    pub repo_root: PathBuf,
    pub agent_dir: PathBuf,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub run: RunState,
}

impl JobState {
    pub fn state_path(&self) -> PathBuf {
        state_path(&self.agent_dir, &self.id)
    }
}

/// One line of `kiln jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub project_name: String,
    /// Task text, truncated for display.
    pub task: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn job_dir(agent_dir: &Path, id: &str) -> PathBuf {
    agent_dir.join("runs").join(id)
}

fn state_path(agent_dir: &Path, id: &str) -> PathBuf {
    job_dir(agent_dir, id).join(STATE_FILE)
}

/// Job IDs name a single directory under `runs/`.
fn is_valid_id(id: &str) -> bool {
    !id.trim().is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// Create a new job directory and record for `task`.
///
/// The job starts in `running` status with every phase pending.
#[instrument(skip_all, fields(agent_dir = %agent_dir.display()))]
pub fn create_job(
    repo_root: &Path,
    agent_dir: &Path,
    task: &str,
    spec: PipelineSpec,
) -> Result<JobState> {
    let id = claim_job_id(agent_dir)?;
    let run_dir = job_dir(agent_dir, &id);
    write_text(&run_dir.join(TASK_FILE), task)?;

    let project_name = repo_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec.name.clone());
    let now = Utc::now();
    let mut job = JobState {
        id,
        project_name,
        repo_root: repo_root.to_path_buf(),
        agent_dir: agent_dir.to_path_buf(),
        status: JobStatus::Running,
        started_at: now,
        updated_at: now,
        ended_at: None,
        error: None,
        run: RunState::new(task, spec, run_dir),
    };
    save_job(&mut job)?;
    info!(job = %job.id, "created job");
    Ok(job)
}

/// Reserve a fresh `YYYYMMDD-HHMMSS` directory, adding `-2`, `-3`, ... when
/// the second is already taken.
fn claim_job_id(agent_dir: &Path) -> Result<String> {
    let runs_dir = agent_dir.join("runs");
    fs::create_dir_all(&runs_dir)
        .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
    let base = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut suffix = 1u32;
    loop {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        match fs::create_dir(runs_dir.join(&id)) {
            Ok(()) => return Ok(id),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("create job dir {id}"));
            }
        }
    }
}

/// Stamp `updated_at` and atomically rewrite the job record.
#[instrument(skip_all, fields(job = %job.id, status = %job.status))]
pub fn save_job(job: &mut JobState) -> Result<()> {
    job.updated_at = Utc::now();
    let path = job.state_path();
    debug!(
        current_phase = job.run.current_phase,
        total_iterations = job.run.total_iterations,
        "writing job record"
    );
    let mut buf = serde_json::to_string_pretty(job).context("serialize job record")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// Load a job record. A missing record is a [`JobNotFound`] error.
#[instrument(skip(agent_dir))]
pub fn load_job(agent_dir: &Path, id: &str) -> Result<JobState> {
    if !is_valid_id(id) {
        return Err(JobNotFound { id: id.to_string() }.into());
    }
    let path = state_path(agent_dir, id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(JobNotFound { id: id.to_string() }.into());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read job record {}", path.display()));
        }
    };
    let job: JobState = serde_json::from_str(&contents)
        .with_context(|| format!("parse job record {}", path.display()))?;
    debug!(status = %job.status, current_phase = job.run.current_phase, "job loaded");
    Ok(job)
}

/// Summaries of every readable job, newest first.
///
/// Unreadable records are skipped with a warning.
#[instrument(skip_all)]
pub fn list_jobs(agent_dir: &Path) -> Result<Vec<JobSummary>> {
    let runs_dir = agent_dir.join("runs");
    let entries = match fs::read_dir(&runs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read runs dir {}", runs_dir.display()));
        }
    };

    let mut summaries = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", runs_dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().into_owned();
        match load_job(agent_dir, &id) {
            Ok(job) => summaries.push(JobSummary {
                task: truncate_task(&job.run.task),
                id: job.id,
                project_name: job.project_name,
                status: job.status,
                started_at: job.started_at,
                updated_at: job.updated_at,
            }),
            Err(err) => warn!(job = %id, err = %format!("{err:#}"), "skipping unreadable job"),
        }
    }
    summaries.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(summaries)
}

fn truncate_task(task: &str) -> String {
    let task = task.trim();
    if task.chars().count() <= SUMMARY_TASK_CHARS {
        return task.to_string();
    }
    let kept: String = task.chars().take(SUMMARY_TASK_CHARS - 3).collect();
    format!("{kept}...")
}

/// Remove a job directory and everything in it.
#[instrument(skip(agent_dir))]
pub fn delete_job(agent_dir: &Path, id: &str) -> Result<()> {
    let dir = job_dir(agent_dir, id);
    if !is_valid_id(id) || !state_path(agent_dir, id).is_file() {
        return Err(JobNotFound { id: id.to_string() }.into());
    }
    fs::remove_dir_all(&dir).with_context(|| format!("delete job dir {}", dir.display()))?;
    info!("deleted job");
    Ok(())
}

/// Record a human answer to the job's pending checkpoint.
///
/// The first unresolved checkpoint (in phase order) is stamped with the
/// resolution, appended to its phase's resolution history and cleared. The
/// phase stays `running` so resume re-enters the same chunk, and the job
/// returns to `running`.
#[instrument(skip(agent_dir, resolution))]
pub fn resolve_checkpoint(agent_dir: &Path, id: &str, resolution: &str) -> Result<JobState> {
    let resolution = resolution.trim();
    if resolution.is_empty() {
        bail!("checkpoint resolution must not be empty");
    }
    let mut job = load_job(agent_dir, id)?;
    if job.status != JobStatus::Checkpoint {
        bail!(
            "job '{id}' is not waiting at a checkpoint (status: {})",
            job.status
        );
    }

    let run_dir = job.run.run_dir.clone();
    let (phase_id, iteration, sub_plan) = job
        .run
        .phases
        .iter_mut()
        .find_map(|phase| {
            let iteration = phase.iteration;
            let phase_id = phase.id.clone();
            phase
                .sub_plan
                .as_mut()
                .filter(|sub_plan| sub_plan.pending_checkpoint().is_some())
                .map(|sub_plan| (phase_id, iteration, sub_plan))
        })
        .ok_or_else(|| anyhow!("job '{id}' has no unresolved checkpoint"))?;

    let Some(mut checkpoint) = sub_plan.checkpoint.take() else {
        bail!("job '{id}' has no unresolved checkpoint");
    };
    checkpoint.resolution = Some(resolution.to_string());
    checkpoint.resolved_at = Some(Utc::now().to_rfc3339());
    sub_plan
        .checkpoint_resolutions
        .push(checkpoint.history_entry());

    let chunk = AttemptPaths::chunk(&run_dir, &phase_id, iteration, sub_plan.chunk_index);
    write_json(&chunk.checkpoint_path, &checkpoint)?;

    job.status = JobStatus::Running;
    save_job(&mut job)?;
    info!(phase = %phase_id, "checkpoint resolved");
    Ok(job)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("job record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp job record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace job record {}", path.display()))?;
    Ok(())
}
