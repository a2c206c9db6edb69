//! Splitting plan steps into bounded worker calls.

use crate::core::types::PlanStep;

/// Maximum number of plan steps handed to the worker in one call.
pub const CHUNK_SIZE: usize = 3;

/// Split `steps` into consecutive groups of at most `size` steps.
///
/// Order is preserved; only the last group may be smaller. A `size` of zero
/// is treated as one.
pub fn chunk_steps(steps: &[PlanStep], size: usize) -> Vec<Vec<PlanStep>> {
    steps.chunks(size.max(1)).map(<[PlanStep]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(n: usize) -> Vec<PlanStep> {
        (1..=n)
            .map(|i| PlanStep {
                id: format!("s{i}"),
                goal: format!("goal {i}"),
                ..PlanStep::default()
            })
            .collect()
    }

    /// Chunk count is ceil(n/3) and the last chunk holds the remainder.
    #[test]
    fn chunk_counts_follow_ceiling_division() {
        for n in 1..=10 {
            let chunks = chunk_steps(&steps(n), CHUNK_SIZE);
            assert_eq!(chunks.len(), n.div_ceil(CHUNK_SIZE), "n={n}");
            let expected_last = if n % CHUNK_SIZE == 0 {
                CHUNK_SIZE
            } else {
                n % CHUNK_SIZE
            };
            assert_eq!(chunks.last().map(Vec::len), Some(expected_last), "n={n}");
        }
    }

    #[test]
    fn chunking_preserves_step_order() {
        let chunks = chunk_steps(&steps(7), CHUNK_SIZE);
        let ids: Vec<&str> = chunks
            .iter()
            .flatten()
            .map(|step| step.id.as_str())
            .collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4", "s5", "s6", "s7"]);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn no_steps_yields_no_chunks() {
        assert!(chunk_steps(&[], CHUNK_SIZE).is_empty());
    }
}
