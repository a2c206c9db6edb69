//! Run-state invariants checked before a stored job is resumed.

use crate::core::types::PhaseStatus;
use crate::state::RunState;

/// Check semantic invariants of a run:
/// - `current_phase` is within `0..=phases.len()`
/// - per-phase iterations within `max_phase_iterations`
/// - total iterations within `max_total_iterations` and equal to the sum of
///   per-phase iterations
/// - only the current phase may be `running`
/// - sub-plan chunk pointers are consistent
pub fn validate_invariants(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();
    let limits = &state.spec.limits;

    if state.phases.len() != state.spec.phases.len() {
        errors.push(format!(
            "run has {} phases but spec defines {}",
            state.phases.len(),
            state.spec.phases.len()
        ));
    }
    if state.current_phase > state.phases.len() {
        errors.push(format!(
            "current_phase {} out of range (0..={})",
            state.current_phase,
            state.phases.len()
        ));
    }
    if state.total_iterations > limits.max_total_iterations {
        errors.push(format!(
            "total_iterations {} exceeds max_total_iterations {}",
            state.total_iterations, limits.max_total_iterations
        ));
    }

    let sum: u32 = state.phases.iter().map(|phase| phase.iteration).sum();
    if sum != state.total_iterations {
        errors.push(format!(
            "phase iterations sum to {sum} but total_iterations is {}",
            state.total_iterations
        ));
    }

    for (idx, phase) in state.phases.iter().enumerate() {
        if phase.iteration > limits.max_phase_iterations {
            errors.push(format!(
                "{}: iteration {} exceeds max_phase_iterations {}",
                phase.id, phase.iteration, limits.max_phase_iterations
            ));
        }
        if phase.status == PhaseStatus::Running && idx != state.current_phase {
            errors.push(format!("{}: running but not the current phase", phase.id));
        }
        if let Some(sub_plan) = &phase.sub_plan {
            if sub_plan.total_chunks != sub_plan.step_groups.len() {
                errors.push(format!(
                    "{}: total_chunks {} does not match {} step groups",
                    phase.id,
                    sub_plan.total_chunks,
                    sub_plan.step_groups.len()
                ));
            }
            if sub_plan.chunk_index > sub_plan.total_chunks {
                errors.push(format!(
                    "{}: chunk_index {} beyond total_chunks {}",
                    phase.id, sub_plan.chunk_index, sub_plan.total_chunks
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::PipelineSpec;
    use crate::state::SubPlanState;

    fn state() -> RunState {
        RunState::new("task", PipelineSpec::default(), "/tmp/run")
    }

    #[test]
    fn fresh_state_is_valid() {
        assert!(validate_invariants(&state()).is_empty());
    }

    #[test]
    fn iteration_sum_must_match_total() {
        let mut state = state();
        state.phases[0].iteration = 2;
        state.total_iterations = 1;
        let errors = validate_invariants(&state);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("sum to 2"));
    }

    #[test]
    fn running_phase_must_be_current() {
        let mut state = state();
        state.phases[3].status = PhaseStatus::Running;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("verify: running")));
    }

    #[test]
    fn chunk_pointer_must_be_in_range() {
        let mut state = state();
        let mut sub_plan = SubPlanState::new(vec![Vec::new()]);
        sub_plan.chunk_index = 3;
        state.phases[2].sub_plan = Some(sub_plan);
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("chunk_index 3")));
    }

    #[test]
    fn over_budget_phase_is_reported() {
        let mut state = state();
        state.spec.limits.max_phase_iterations = 1;
        state.phases[1].iteration = 2;
        state.total_iterations = 2;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("plan: iteration 2")));
    }
}
