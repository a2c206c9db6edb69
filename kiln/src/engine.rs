//! Phase state machine driving a job through its pipeline.
//!
//! The engine owns the [`JobState`] while it runs and rewrites the job
//! record after every transition, so whatever stops it (a fatal error, a
//! pause, a checkpoint or a crash) leaves an accurate record behind.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::budget::{IterationBudget, check_new_attempt};
use crate::core::chunking::{CHUNK_SIZE, chunk_steps};
use crate::core::control::plan_steps;
use crate::core::types::{Checkpoint, JobStatus, PhaseStatus, PlanStep};
use crate::error::{CheckpointRaised, PauseReason, PausedError};
use crate::events::{EngineEvent, EventSink};
use crate::io::config::{IMPLEMENT_PHASE, PLAN_PHASE, VERIFY_PHASE};
use crate::io::gates::GateRunner;
use crate::io::job_store::{JobState, save_job};
use crate::io::worker::{Worker, WorkerRequest};
use crate::state::Transition;

/// How a call to [`Engine::run`] ended, short of a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every phase passed.
    Completed,
    /// Cancelled or timed out; resumable as is.
    Paused(PauseReason),
    /// A chunk is waiting for a human; resumable once resolved.
    Checkpoint(Checkpoint),
}

/// Result of one phase attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PhaseVerdict {
    Passed,
    /// Verification failed; the summary is fed back to the next implement
    /// attempt.
    Failed { feedback: String },
}

pub struct Engine<'a, W: Worker, G: GateRunner> {
    pub(crate) job: JobState,
    pub(crate) worker: &'a W,
    pub(crate) gates: &'a G,
    pub(crate) events: EventSink,
    pub(crate) cancel: CancelToken,
}

impl<'a, W: Worker, G: GateRunner> Engine<'a, W, G> {
    pub fn new(
        job: JobState,
        worker: &'a W,
        gates: &'a G,
        events: EventSink,
        cancel: CancelToken,
    ) -> Self {
        Self {
            job,
            worker,
            gates,
            events,
            cancel,
        }
    }

    pub fn into_job(self) -> JobState {
        self.job
    }

    /// Drive the job until it completes, pauses, stops at a checkpoint or
    /// fails, recording the job status for each case.
    ///
    /// Fatal errors mark the job `failed` and are returned with the phase
    /// and iteration as context.
    #[instrument(skip_all, fields(job = %self.job.id))]
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.job.status = JobStatus::Running;
        self.job.error = None;
        self.job.ended_at = None;
        self.persist()?;

        match self.drive() {
            Ok(outcome) => {
                match &outcome {
                    RunOutcome::Completed => {
                        info!("job completed");
                        self.job.status = JobStatus::Completed;
                        self.job.ended_at = Some(Utc::now());
                    }
                    RunOutcome::Paused(reason) => {
                        info!(reason = %reason, "job paused");
                        self.job.status = JobStatus::Paused;
                    }
                    RunOutcome::Checkpoint(checkpoint) => {
                        info!(kind = checkpoint.kind.as_str(), "job waiting at checkpoint");
                        self.job.status = JobStatus::Checkpoint;
                    }
                }
                self.persist()?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "job failed");
                self.job.status = JobStatus::Failed;
                self.job.error = Some(format!("{err:#}"));
                self.job.ended_at = Some(Utc::now());
                if let Err(save_err) = self.persist() {
                    warn!(err = %format!("{save_err:#}"), "could not record job failure");
                }
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<RunOutcome> {
        while !self.job.run.is_complete() {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Paused(PauseReason::Cancelled));
            }

            let index = self.job.run.current_phase;
            let resumed = self.job.run.phases[index].status == PhaseStatus::Running;
            if !resumed {
                self.begin_attempt(index)?;
            }
            let phase_id = self.job.run.phases[index].id.clone();
            let iteration = self.job.run.phases[index].iteration;
            info!(phase = %phase_id, iteration, resumed, "phase attempt");
            self.events.emit(EngineEvent::PhaseStarted {
                index,
                phase: phase_id.clone(),
                iteration,
                resumed,
            });

            let verdict = match self.execute_phase(index) {
                Ok(verdict) => verdict,
                Err(err) => {
                    if let Some(paused) = err.downcast_ref::<PausedError>() {
                        return Ok(RunOutcome::Paused(paused.reason));
                    }
                    if let Some(raised) = err.downcast_ref::<CheckpointRaised>() {
                        return Ok(RunOutcome::Checkpoint(raised.checkpoint.clone()));
                    }
                    self.finish_phase(index, PhaseStatus::Failed, Some(format!("{err:#}")));
                    return Err(err.context(format!("phase '{phase_id}' iteration {iteration}")));
                }
            };

            match verdict {
                PhaseVerdict::Passed => {
                    self.finish_phase(index, PhaseStatus::Passed, None);
                    self.job.run.apply(Transition::Advance)?;
                }
                PhaseVerdict::Failed { feedback } => {
                    info!(phase = %phase_id, "verification failed, looping back");
                    self.finish_phase(index, PhaseStatus::Failed, Some(feedback));
                    self.events.emit(EngineEvent::LoopBack {
                        from: phase_id,
                        to: IMPLEMENT_PHASE.to_string(),
                    });
                    self.job
                        .run
                        .apply(Transition::GoTo(IMPLEMENT_PHASE.to_string()))?;
                }
            }
            self.persist()?;
        }
        Ok(RunOutcome::Completed)
    }

    /// Start a new attempt of phase `index`, consuming one iteration.
    ///
    /// Budgets are checked first, so the counters never exceed the limits.
    fn begin_attempt(&mut self, index: usize) -> Result<()> {
        let limits = &self.job.run.spec.limits;
        let budget = IterationBudget {
            max_total: limits.max_total_iterations,
            max_phase: limits.max_phase_iterations,
        };
        let total = self.job.run.total_iterations;
        let phase = &mut self.job.run.phases[index];
        check_new_attempt(budget, &phase.id, phase.iteration, total)
            .with_context(|| format!("phase '{}'", phase.id))?;

        phase.iteration += 1;
        phase.status = PhaseStatus::Running;
        phase.error = None;
        phase.narration = None;
        phase.control = None;
        phase.sub_plan = None;
        self.job.run.total_iterations += 1;
        self.persist()
    }

    fn execute_phase(&mut self, index: usize) -> Result<PhaseVerdict> {
        let phase_id = self.job.run.phases[index].id.clone();
        if phase_id == VERIFY_PHASE {
            return self.run_verify(index);
        }
        if phase_id == IMPLEMENT_PHASE {
            if let Some(groups) = self.chunk_plan() {
                self.run_chunked(index, groups)?;
                return Ok(PhaseVerdict::Passed);
            }
        }
        self.run_single(index)?;
        Ok(PhaseVerdict::Passed)
    }

    /// Plan steps grouped into chunks, when the plan phase produced any.
    ///
    /// A missing or malformed plan falls back to a single implement call.
    fn chunk_plan(&self) -> Option<Vec<Vec<PlanStep>>> {
        let control = self.job.run.phase(PLAN_PHASE)?.control.as_ref()?;
        match plan_steps(control) {
            Ok(steps) if !steps.is_empty() => Some(chunk_steps(&steps, CHUNK_SIZE)),
            Ok(_) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "plan steps unusable, implementing in one call");
                None
            }
        }
    }

    fn finish_phase(&mut self, index: usize, status: PhaseStatus, error: Option<String>) {
        let phase = &mut self.job.run.phases[index];
        phase.status = status;
        phase.error = error;
        self.events.emit(EngineEvent::PhaseFinished {
            index,
            phase: phase.id.clone(),
            status,
        });
    }

    pub(crate) fn worker_request(
        &self,
        phase: &str,
        prompt: String,
        log_path: &Path,
    ) -> WorkerRequest {
        let settings = &self.job.run.spec.worker;
        WorkerRequest {
            command: settings.command.clone(),
            phase: phase.to_string(),
            prompt,
            workdir: self.job.repo_root.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            output_limit_bytes: settings.output_limit_bytes,
            cancel: self.cancel.clone(),
            events: self.events.clone(),
            log_path: log_path.to_path_buf(),
        }
    }

    pub(crate) fn persist(&mut self) -> Result<()> {
        save_job(&mut self.job)
    }
}
