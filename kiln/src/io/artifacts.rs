//! Run artifact layout under `.kiln/runs/<job>/`.
//!
//! Every worker call leaves its raw output, validated control JSON and
//! narration behind, keyed by phase, iteration and chunk, so a failed run can
//! be examined after the fact.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Files written for one worker call (a phase attempt or a single chunk).
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub worker_output_path: PathBuf,
    pub worker_log_path: PathBuf,
    pub control_path: PathBuf,
    pub narration_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

impl AttemptPaths {
    /// `<run_dir>/<phase>/iter_<iteration>/`
    pub fn phase(run_dir: &Path, phase: &str, iteration: u32) -> Self {
        Self::in_dir(phase_dir(run_dir, phase, iteration))
    }

    /// `<run_dir>/<phase>/iter_<iteration>/chunk_<index>/`
    pub fn chunk(run_dir: &Path, phase: &str, iteration: u32, index: usize) -> Self {
        Self::in_dir(phase_dir(run_dir, phase, iteration).join(format!("chunk_{index}")))
    }

    fn in_dir(dir: PathBuf) -> Self {
        Self {
            worker_output_path: dir.join("worker_output.txt"),
            worker_log_path: dir.join("worker.log"),
            control_path: dir.join("control.json"),
            narration_path: dir.join("narration.md"),
            checkpoint_path: dir.join("checkpoint.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))
    }
}

/// Verification evidence written next to the verify attempt.
#[derive(Debug, Clone)]
pub struct VerifyPaths {
    pub gate_dir: PathBuf,
    pub gates_path: PathBuf,
    pub goal_backward_path: PathBuf,
}

impl VerifyPaths {
    pub fn new(attempt: &AttemptPaths) -> Self {
        Self {
            gate_dir: attempt.dir.join("gate_outputs"),
            gates_path: attempt.dir.join("gates.json"),
            goal_backward_path: attempt.dir.join("goal_backward.json"),
        }
    }
}

fn phase_dir(run_dir: &Path, phase: &str, iteration: u32) -> PathBuf {
    run_dir.join(phase).join(format!("iter_{iteration}"))
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}
