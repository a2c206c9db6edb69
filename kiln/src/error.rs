//! Typed stop conditions surfaced through `anyhow::Error`.
//!
//! Callers recover these with `err.downcast_ref::<T>()` at the loop boundary
//! to tell a paused run from a failed one.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::Checkpoint;

/// Why a run stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Cancelled,
    TimedOut,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Cancelled => f.write_str("cancelled"),
            PauseReason::TimedOut => f.write_str("timed out"),
        }
    }
}

/// A worker or gate subprocess was cancelled or ran out of time.
#[derive(Debug, Clone, Error)]
#[error("execution paused ({reason})")]
pub struct PausedError {
    pub reason: PauseReason,
}

/// A chunk asked for human input before it can continue.
#[derive(Debug, Clone, Error)]
#[error("checkpoint requested ({}): {}", .checkpoint.kind.as_str(), .checkpoint.message)]
pub struct CheckpointRaised {
    pub checkpoint: Checkpoint,
}

/// Iteration budget exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IterationLimitError {
    #[error("reached max total iterations ({max})")]
    Total { max: u32 },
    #[error("phase '{phase}' reached max iterations ({max})")]
    Phase { phase: String, max: u32 },
}

#[derive(Debug, Clone, Error)]
#[error("job '{id}' not found")]
pub struct JobNotFound {
    pub id: String,
}

/// Worker output held more than one candidate JSON object.
#[derive(Debug, Clone, Error)]
#[error("ambiguous worker output: {count} distinct JSON objects found")]
pub struct AmbiguousOutput {
    pub count: usize,
}
