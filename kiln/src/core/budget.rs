//! Iteration budget checks for phase attempts.

use crate::error::IterationLimitError;

/// Iteration limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    pub max_total: u32,
    pub max_phase: u32,
}

/// Check whether a new attempt of `phase` may start.
///
/// Runs before the counters are incremented, so persisted counters never
/// exceed their limits.
pub fn check_new_attempt(
    budget: IterationBudget,
    phase: &str,
    phase_iteration: u32,
    total_iterations: u32,
) -> Result<(), IterationLimitError> {
    if total_iterations >= budget.max_total {
        return Err(IterationLimitError::Total {
            max: budget.max_total,
        });
    }
    if phase_iteration >= budget.max_phase {
        return Err(IterationLimitError::Phase {
            phase: phase.to_string(),
            max: budget.max_phase,
        });
    }
    Ok(())
}
