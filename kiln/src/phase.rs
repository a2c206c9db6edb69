//! Single-call phase execution and the verify phase.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::control::{file_changes, implemented_paths, narration, plan_steps, planned_files};
use crate::core::extract::extract_json;
use crate::core::types::{ControlJson, GateResult, PhaseStatus, VerifyReport};
use crate::engine::{Engine, PhaseVerdict};
use crate::events::EngineEvent;
use crate::io::artifacts::{AttemptPaths, VerifyPaths, write_json, write_text};
use crate::io::config::{IMPLEMENT_PHASE, PLAN_PHASE, VERIFY_PHASE};
use crate::io::files::apply_file_changes;
use crate::io::gates::{GateContext, GateRunner, run_gates};
use crate::io::git::Git;
use crate::io::prompt::{PriorOutput, PromptBuilder, PromptInputs, load_prompt, read_optional};
use crate::io::schema::{PhaseSchema, load_schema};
use crate::io::worker::Worker;
use crate::verify::GoalBackwardVerifier;

/// Lines of a failed gate's log quoted back to the worker.
const FEEDBACK_LOG_LINES: usize = 30;

impl<W: Worker, G: GateRunner> Engine<'_, W, G> {
    /// Run phase `index` as one worker call: prompt, extract, validate,
    /// record, and for implement apply the listed file changes.
    #[instrument(skip_all, fields(phase = %self.job.run.phases[index].id))]
    pub(crate) fn run_single(&mut self, index: usize) -> Result<()> {
        let phase_id = self.job.run.phases[index].id.clone();
        let iteration = self.job.run.phases[index].iteration;
        let attempt = AttemptPaths::phase(&self.job.run.run_dir, &phase_id, iteration);
        attempt.create()?;

        let (inputs, schema) = self.prompt_inputs(index)?;
        let prompt = PromptBuilder::new(self.job.run.spec.prompt.budget_bytes)
            .build_phase(&inputs)
            .with_context(|| format!("build {phase_id} prompt"))?;
        let request = self.worker_request(&phase_id, prompt, &attempt.worker_log_path);
        let output = self.worker.invoke(&request)?;
        write_text(&attempt.worker_output_path, &output)?;

        let control = extract_json(&output).context("extract worker output")?;
        schema.validate(&control)?;
        write_json(&attempt.control_path, &control)?;
        self.forward_narration(&phase_id, &control, &attempt)?;

        if phase_id == IMPLEMENT_PHASE {
            let changes = file_changes(&control)?;
            apply_file_changes(&self.job.repo_root, &changes, &self.events)
                .context("apply file changes")?;
        }

        let phase = &mut self.job.run.phases[index];
        phase.narration = narration(&control).map(str::to_string);
        phase.output = output;
        phase.control = Some(control);
        Ok(())
    }

    /// Worker call, then gates and the goal-backward audit. Passes only
    /// when every gate and every audit check passes.
    #[instrument(skip_all)]
    pub(crate) fn run_verify(&mut self, index: usize) -> Result<PhaseVerdict> {
        self.run_single(index)?;

        let iteration = self.job.run.phases[index].iteration;
        let attempt = AttemptPaths::phase(&self.job.run.run_dir, VERIFY_PHASE, iteration);
        let paths = VerifyPaths::new(&attempt);

        let gate_results = run_gates(
            self.gates,
            &self.job.run.spec,
            &GateContext {
                workdir: &self.job.repo_root,
                run_dir: &self.job.run.run_dir,
                gate_dir: &paths.gate_dir,
                cancel: &self.cancel,
                events: &self.events,
            },
        )?;
        write_json(&paths.gates_path, &gate_results)?;

        let report = GoalBackwardVerifier::new(&self.job.repo_root)
            .verify(&self.planned_files(), &self.implemented_files());
        write_json(&paths.goal_backward_path, &report)?;
        self.events.emit(EngineEvent::Verification {
            summary: report.summary.clone(),
            failures: report.failures().cloned().collect(),
        });

        let gates_passed = gate_results.iter().all(|gate| gate.passed);
        debug!(gates_passed, audit_passed = report.all_passed, "verification finished");
        if gates_passed && report.all_passed {
            return Ok(PhaseVerdict::Passed);
        }
        Ok(PhaseVerdict::Failed {
            feedback: verification_feedback(&gate_results, &report, &self.job.run.run_dir),
        })
    }

    /// Shared prompt inputs for phase `index`, plus its compiled schema.
    pub(crate) fn prompt_inputs(&self, index: usize) -> Result<(PromptInputs, PhaseSchema)> {
        let phase = &self.job.run.phases[index];
        let agent_dir = &self.job.agent_dir;
        let schema = load_schema(agent_dir, &phase.schema)?;

        let prior_outputs = self.job.run.phases[..index]
            .iter()
            .filter(|prior| prior.status == PhaseStatus::Passed)
            .filter_map(|prior| {
                let control = prior.control.as_ref()?;
                let json = serde_json::to_string_pretty(&Value::Object(control.clone())).ok()?;
                Some(PriorOutput {
                    phase: prior.id.clone(),
                    json,
                })
            })
            .collect();

        let feedback = if phase.id == IMPLEMENT_PHASE {
            self.job
                .run
                .phase(VERIFY_PHASE)
                .filter(|verify| verify.status == PhaseStatus::Failed)
                .and_then(|verify| verify.error.clone())
        } else {
            None
        };

        let inputs = PromptInputs {
            phase: phase.id.clone(),
            agents: read_optional(agent_dir.join("AGENTS.md"))?,
            system: load_prompt(agent_dir, "system")?,
            phase_instructions: load_prompt(agent_dir, &format!("phase_{}", phase.id))?,
            task: self.job.run.task.clone(),
            schema: schema.raw.clone(),
            diff: Git::new(&self.job.repo_root).cumulative_diff(),
            prior_outputs,
            feedback,
        };
        Ok((inputs, schema))
    }

    /// Write and announce the narration of one worker reply, if it has one.
    pub(crate) fn forward_narration(
        &self,
        phase_id: &str,
        control: &ControlJson,
        attempt: &AttemptPaths,
    ) -> Result<()> {
        if let Some(text) = narration(control) {
            write_text(&attempt.narration_path, &format!("{text}\n"))?;
            self.events.emit(EngineEvent::Narration {
                phase: phase_id.to_string(),
                text: text.to_string(),
            });
        }
        Ok(())
    }

    fn planned_files(&self) -> Vec<String> {
        self.job
            .run
            .phase(PLAN_PHASE)
            .and_then(|plan| plan.control.as_ref())
            .and_then(|control| plan_steps(control).ok())
            .map(|steps| planned_files(&steps))
            .unwrap_or_default()
    }

    fn implemented_files(&self) -> Vec<String> {
        self.job
            .run
            .phase(IMPLEMENT_PHASE)
            .and_then(|implement| implement.control.as_ref())
            .map(implemented_paths)
            .unwrap_or_default()
    }
}

/// Summary of what failed in a verify attempt, written for the worker.
fn verification_feedback(gates: &[GateResult], report: &VerifyReport, run_dir: &Path) -> String {
    let mut out = String::new();
    for gate in gates.iter().filter(|gate| !gate.passed) {
        out.push_str(&format!(
            "Gate '{}' failed (exit {}): {}\n",
            gate.name, gate.exit_code, gate.command
        ));
        if let Ok(log) = fs::read_to_string(run_dir.join(&gate.output_ref)) {
            let lines: Vec<&str> = log.lines().collect();
            let tail = &lines[lines.len().saturating_sub(FEEDBACK_LOG_LINES)..];
            if !tail.is_empty() {
                out.push_str("```\n");
                out.push_str(&tail.join("\n"));
                out.push_str("\n```\n");
            }
        }
    }
    if !report.all_passed {
        out.push_str(&report.summary);
        out.push('\n');
        for check in report.failures() {
            out.push_str(&format!(
                "- [{}] {}: {}\n",
                check.category.as_str(),
                check.file,
                check.detail
            ));
        }
    }
    out.trim_end().to_string()
}
