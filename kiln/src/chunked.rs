//! Chunked implement execution.
//!
//! The plan's steps are implemented a few at a time, one worker call per
//! chunk. Each chunk's file changes land on disk and the job record is
//! rewritten before the next chunk starts, so an interruption loses at most
//! the chunk in flight and resume picks up at the same chunk index.

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument};

use crate::core::control::{file_changes, implemented_paths};
use crate::core::extract::{detect_checkpoint, extract_json};
use crate::core::types::PlanStep;
use crate::engine::Engine;
use crate::error::{CheckpointRaised, PauseReason, PausedError};
use crate::events::EngineEvent;
use crate::io::artifacts::{AttemptPaths, write_json, write_text};
use crate::io::files::apply_file_changes;
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::prompt::{ChunkInputs, PromptBuilder};
use crate::io::worker::Worker;
use crate::state::SubPlanState;

impl<W: Worker, G: GateRunner> Engine<'_, W, G> {
    /// Run (or continue) the chunk loop of implement phase `index`.
    ///
    /// A sub-plan left by an interrupted attempt is continued from its
    /// chunk index; otherwise `groups` starts a fresh one. On completion the
    /// chunk outputs are merged into one implement control object and the
    /// sub-plan is discarded.
    #[instrument(skip_all, fields(phase = %self.job.run.phases[index].id))]
    pub(crate) fn run_chunked(&mut self, index: usize, groups: Vec<Vec<PlanStep>>) -> Result<()> {
        let phase_id = self.job.run.phases[index].id.clone();
        let iteration = self.job.run.phases[index].iteration;
        let run_dir = self.job.run.run_dir.clone();

        match &self.job.run.phases[index].sub_plan {
            Some(sub_plan) => {
                if let Some(checkpoint) = sub_plan.pending_checkpoint() {
                    bail!(
                        "chunk {} is waiting for checkpoint resolution: {}",
                        sub_plan.chunk_index + 1,
                        checkpoint.message
                    );
                }
                info!(
                    chunk = sub_plan.chunk_index + 1,
                    total = sub_plan.total_chunks,
                    "continuing chunked implement"
                );
            }
            None => {
                info!(total = groups.len(), "starting chunked implement");
                self.job.run.phases[index].sub_plan = Some(SubPlanState::new(groups));
                self.persist()?;
            }
        }

        let (inputs, schema) = self.prompt_inputs(index)?;
        let builder = PromptBuilder::new(self.job.run.spec.prompt.budget_bytes);

        loop {
            let sub_plan = current_sub_plan(&self.job.run.phases[index].sub_plan)?;
            if sub_plan.is_finished() {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(PausedError {
                    reason: PauseReason::Cancelled,
                }
                .into());
            }

            let chunk_index = sub_plan.chunk_index;
            let total = sub_plan.total_chunks;
            let steps = sub_plan
                .step_groups
                .get(chunk_index)
                .ok_or_else(|| anyhow!("chunk {chunk_index} has no steps"))?;
            info!(chunk = chunk_index + 1, total, "running chunk");
            self.events.emit(EngineEvent::ChunkStarted {
                index: chunk_index,
                total,
                step_ids: steps.iter().map(|step| step.id.clone()).collect(),
            });

            let prompt = builder
                .build_chunk(
                    &inputs,
                    &ChunkInputs {
                        index: chunk_index,
                        total,
                        steps,
                        completed_files: &sub_plan.completed_files,
                        cumulative_diff: &sub_plan.cumulative_diff,
                        resolutions: &sub_plan.checkpoint_resolutions,
                    },
                )
                .with_context(|| format!("build prompt for chunk {}", chunk_index + 1))?;

            let attempt = AttemptPaths::chunk(&run_dir, &phase_id, iteration, chunk_index);
            attempt.create()?;
            let request = self.worker_request(&phase_id, prompt, &attempt.worker_log_path);
            let output = self.worker.invoke(&request)?;
            write_text(&attempt.worker_output_path, &output)?;

            // Checkpoint payloads need not match the implement schema.
            let extracted = extract_json(&output);
            if let Some(checkpoint) = detect_checkpoint(&output, extracted.as_ref().ok()) {
                info!(
                    chunk = chunk_index + 1,
                    kind = checkpoint.kind.as_str(),
                    "chunk raised a checkpoint"
                );
                write_json(&attempt.checkpoint_path, &checkpoint)?;
                current_sub_plan_mut(&mut self.job.run.phases[index].sub_plan)?.checkpoint =
                    Some(checkpoint.clone());
                self.persist()?;
                self.events.emit(EngineEvent::Checkpoint(checkpoint.clone()));
                return Err(CheckpointRaised { checkpoint }.into());
            }

            let control = extracted
                .with_context(|| format!("extract output of chunk {}", chunk_index + 1))?;
            schema
                .validate(&control)
                .with_context(|| format!("validate output of chunk {}", chunk_index + 1))?;
            write_json(&attempt.control_path, &control)?;
            self.forward_narration(&phase_id, &control, &attempt)?;

            let changes = file_changes(&control)?;
            apply_file_changes(&self.job.repo_root, &changes, &self.events)
                .with_context(|| format!("apply file changes of chunk {}", chunk_index + 1))?;
            let diff = Git::new(&self.job.repo_root).cumulative_diff();

            let sub_plan = current_sub_plan_mut(&mut self.job.run.phases[index].sub_plan)?;
            sub_plan.accumulated.absorb(chunk_index + 1, &control);
            for path in implemented_paths(&control) {
                if !sub_plan.completed_files.contains(&path) {
                    sub_plan.completed_files.push(path);
                }
            }
            sub_plan.cumulative_diff = diff;
            sub_plan.chunk_index += 1;
            self.persist()?;
        }

        let merged = current_sub_plan(&self.job.run.phases[index].sub_plan)?
            .accumulated
            .to_control();
        let attempt = AttemptPaths::phase(&run_dir, &phase_id, iteration);
        write_json(&attempt.control_path, &merged)?;

        let phase = &mut self.job.run.phases[index];
        phase.control = Some(merged);
        phase.sub_plan = None;
        info!("chunked implement finished");
        Ok(())
    }
}

fn current_sub_plan(slot: &Option<SubPlanState>) -> Result<&SubPlanState> {
    slot.as_ref()
        .ok_or_else(|| anyhow!("implement phase has no sub-plan"))
}

fn current_sub_plan_mut(slot: &mut Option<SubPlanState>) -> Result<&mut SubPlanState> {
    slot.as_mut()
        .ok_or_else(|| anyhow!("implement phase has no sub-plan"))
}
