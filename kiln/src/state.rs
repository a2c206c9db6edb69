//! In-memory run model shared by the engine and the job record.
//!
//! [`RunState`] is the root of a single run. The phase pointer only moves
//! through [`RunState::apply`], which makes the loop-back rule checkable in
//! one place.

use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::control::ChunkAccumulator;
use crate::core::types::{Checkpoint, ControlJson, PhaseStatus, PlanStep};
use crate::io::config::PipelineSpec;

/// Progress of one configured phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub id: String,
    /// Schema path relative to the agent directory.
    pub schema: String,
    pub status: PhaseStatus,
    /// Attempts started so far; never exceeds the phase iteration limit.
    pub iteration: u32,
    /// Raw worker output of the latest attempt (kept on disk, not in the record).
    #[serde(skip)]
    pub output: String,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub control: Option<ControlJson>,
    #[serde(default)]
    pub sub_plan: Option<SubPlanState>,
}

impl PhaseState {
    pub fn pending(id: &str, schema: &str) -> Self {
        Self {
            id: id.to_string(),
            schema: schema.to_string(),
            status: PhaseStatus::Pending,
            iteration: 0,
            output: String::new(),
            narration: None,
            error: None,
            control: None,
            sub_plan: None,
        }
    }
}

/// Chunk-level progress of a chunked implement attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPlanState {
    /// Chunk currently in flight (or next to run).
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub step_groups: Vec<Vec<PlanStep>>,
    pub completed_files: Vec<String>,
    pub cumulative_diff: String,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub checkpoint_resolutions: Vec<String>,
    /// Outputs of the chunks already applied.
    #[serde(default)]
    pub accumulated: ChunkAccumulator,
}

impl SubPlanState {
    pub fn new(step_groups: Vec<Vec<PlanStep>>) -> Self {
        Self {
            chunk_index: 0,
            total_chunks: step_groups.len(),
            step_groups,
            completed_files: Vec::new(),
            cumulative_diff: String::new(),
            checkpoint: None,
            checkpoint_resolutions: Vec::new(),
            accumulated: ChunkAccumulator::default(),
        }
    }

    /// The checkpoint still waiting for a human, if any.
    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref().filter(|cp| !cp.is_resolved())
    }

    pub fn is_finished(&self) -> bool {
        self.chunk_index >= self.total_chunks
    }
}

/// Defined moves of the phase pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The current phase passed; move to the next one.
    Advance,
    /// Loop back to an earlier (or the current) phase by id.
    GoTo(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub task: String,
    pub spec: PipelineSpec,
    pub phases: Vec<PhaseState>,
    /// Index into `phases`; equals `phases.len()` once every phase passed.
    pub current_phase: usize,
    pub total_iterations: u32,
    /// Directory holding this run's artifacts.
    pub run_dir: PathBuf,
}

impl RunState {
    pub fn new(task: impl Into<String>, spec: PipelineSpec, run_dir: impl Into<PathBuf>) -> Self {
        let phases = spec
            .phases
            .iter()
            .map(|def| PhaseState::pending(&def.id, &def.required_outputs_schema))
            .collect();
        Self {
            task: task.into(),
            spec,
            phases,
            current_phase: 0,
            total_iterations: 0,
            run_dir: run_dir.into(),
        }
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|phase| phase.id == id)
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|phase| phase.id == id)
    }

    pub fn current(&self) -> Option<&PhaseState> {
        self.phases.get(self.current_phase)
    }

    pub fn is_complete(&self) -> bool {
        self.current_phase >= self.phases.len()
    }

    /// Move the phase pointer. `GoTo` may only target the current or an
    /// earlier phase.
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        match transition {
            Transition::Advance => {
                if self.is_complete() {
                    bail!("cannot advance past the last phase");
                }
                self.current_phase += 1;
            }
            Transition::GoTo(id) => {
                let target = self
                    .phase_index(&id)
                    .ok_or_else(|| anyhow!("loop-back target phase '{id}' is not configured"))?;
                if target > self.current_phase {
                    bail!(
                        "loop-back to '{id}' would move forward (from {} to {target})",
                        self.current_phase
                    );
                }
                self.current_phase = target;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::{IMPLEMENT_PHASE, VERIFY_PHASE};

    fn state() -> RunState {
        RunState::new("task", PipelineSpec::default(), "/tmp/run")
    }

    #[test]
    fn new_state_has_pending_phases() {
        let state = state();
        assert_eq!(state.phases.len(), 5);
        assert!(
            state
                .phases
                .iter()
                .all(|p| p.status == PhaseStatus::Pending && p.iteration == 0)
        );
        assert_eq!(state.current().map(|p| p.id.as_str()), Some("context"));
    }

    #[test]
    fn advance_stops_at_end() {
        let mut state = state();
        for _ in 0..5 {
            state.apply(Transition::Advance).expect("advance");
        }
        assert!(state.is_complete());
        assert!(state.apply(Transition::Advance).is_err());
    }

    #[test]
    fn goto_moves_back_only() {
        let mut state = state();
        let verify = state.phase_index(VERIFY_PHASE).expect("verify");
        state.current_phase = verify;
        state
            .apply(Transition::GoTo(IMPLEMENT_PHASE.to_string()))
            .expect("loop back");
        assert_eq!(state.current_phase, verify - 1);

        let err = state
            .apply(Transition::GoTo("deliver".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("move forward"));
        assert!(state.apply(Transition::GoTo("missing".to_string())).is_err());
    }

    #[test]
    fn sub_plan_tracks_pending_checkpoint() {
        let mut sub_plan = SubPlanState::new(vec![vec![PlanStep::default()]]);
        assert_eq!(sub_plan.total_chunks, 1);
        assert!(sub_plan.pending_checkpoint().is_none());
        sub_plan.checkpoint = Some(Checkpoint {
            kind: crate::core::types::CheckpointKind::HumanVerify,
            message: "check the UI".to_string(),
            options: Vec::new(),
            resolution: None,
            resolved_at: None,
        });
        assert!(sub_plan.pending_checkpoint().is_some());
    }
}
