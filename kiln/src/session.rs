//! Orchestration for starting and resuming jobs.
//!
//! A job is one run of the pipeline over one task. Starting a job snapshots
//! `.kiln/spec.toml` into a fresh job record; resuming reloads the record,
//! checks that it is still consistent and hands it back to the engine.

use anyhow::{Result, bail};
use tracing::{debug, info, instrument};

use crate::cancel::CancelToken;
use crate::core::invariants::validate_invariants;
use crate::core::types::JobStatus;
use crate::engine::{Engine, RunOutcome};
use crate::events::EventSink;
use crate::io::config::load_spec;
use crate::io::gates::GateRunner;
use crate::io::init::KilnPaths;
use crate::io::job_store::{JobState, create_job, load_job};
use crate::io::worker::Worker;

/// Collaborators shared by every engine run in a process.
pub struct Runtime<'a, W: Worker, G: GateRunner> {
    pub worker: &'a W,
    pub gates: &'a G,
    pub events: EventSink,
    pub cancel: CancelToken,
}

impl<W: Worker, G: GateRunner> Runtime<'_, W, G> {
    fn drive(&self, job: JobState) -> JobRun {
        let mut engine = Engine::new(
            job,
            self.worker,
            self.gates,
            self.events.clone(),
            self.cancel.clone(),
        );
        let outcome = engine.run();
        JobRun {
            job: engine.into_job(),
            outcome,
        }
    }
}

/// A job after one engine run, with how that run ended.
///
/// Fatal engine errors land in `outcome`; the job record already reflects
/// them (`failed` status and error text).
#[derive(Debug)]
pub struct JobRun {
    pub job: JobState,
    pub outcome: Result<RunOutcome>,
}

#[derive(Debug)]
pub enum ResumeOutcome {
    /// The job had already completed; nothing ran.
    AlreadyCompleted(JobState),
    Ran(JobRun),
}

/// Create a job for `task` in the project at `paths.root` and run it.
///
/// Errors returned directly (rather than in [`JobRun::outcome`]) mean no job
/// was started: unreadable spec, empty task, or the job record could not be
/// created.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn start_job<W: Worker, G: GateRunner>(
    paths: &KilnPaths,
    task: &str,
    runtime: &Runtime<'_, W, G>,
) -> Result<JobRun> {
    if task.trim().is_empty() {
        bail!("task must not be empty");
    }
    if !paths.agent_dir.is_dir() {
        bail!(
            "{} not found (run `kiln init` first)",
            paths.agent_dir.display()
        );
    }
    let spec = load_spec(&paths.spec_path)?;
    debug!(name = %spec.name, phases = spec.phases.len(), "spec loaded");

    let job = create_job(&paths.root, &paths.agent_dir, task.trim(), spec)?;
    info!(job = %job.id, "starting job");
    Ok(runtime.drive(job))
}

/// Continue job `id` from where its record says it stopped.
///
/// A job waiting at a checkpoint must be resolved first. Records that break
/// run invariants are refused rather than driven.
#[instrument(skip(paths, runtime))]
pub fn resume_job<W: Worker, G: GateRunner>(
    paths: &KilnPaths,
    id: &str,
    runtime: &Runtime<'_, W, G>,
) -> Result<ResumeOutcome> {
    let job = load_job(&paths.agent_dir, id)?;
    if job.status == JobStatus::Completed {
        info!(job = %job.id, "job already completed");
        return Ok(ResumeOutcome::AlreadyCompleted(job));
    }

    let waiting = job
        .run
        .phases
        .iter()
        .filter_map(|phase| phase.sub_plan.as_ref())
        .find_map(|sub_plan| sub_plan.pending_checkpoint());
    if job.status == JobStatus::Checkpoint || waiting.is_some() {
        bail!(
            "job {} is waiting at a checkpoint (run `kiln resolve {} <resolution>` first)",
            job.id,
            job.id
        );
    }

    let errors = validate_invariants(&job.run);
    if !errors.is_empty() {
        bail!(
            "job {} has an inconsistent record:\n- {}",
            job.id,
            errors.join("\n- ")
        );
    }

    info!(
        job = %job.id,
        status = %job.status,
        phase = job.run.current().map(|phase| phase.id.as_str()).unwrap_or("-"),
        "resuming job"
    );
    Ok(ResumeOutcome::Ran(runtime.drive(job)))
}
