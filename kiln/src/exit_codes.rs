//! Stable exit codes for kiln CLI commands.

/// Command succeeded or the job completed.
pub const OK: i32 = 0;
/// Fatal error: bad layout or config, invalid output, budget exhausted.
pub const FAILED: i32 = 1;
/// The job ID does not name a stored job.
pub const NOT_FOUND: i32 = 2;
/// The run was cancelled or timed out and can be resumed.
pub const PAUSED: i32 = 3;
/// The run stopped at a checkpoint; resolve it, then resume.
pub const CHECKPOINT: i32 = 4;
