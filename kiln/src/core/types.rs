//! Shared deterministic types for kiln core logic.
//!
//! These types define stable contracts between core components and the
//! persisted job record. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form structured output returned by the worker for one phase.
///
/// Validated against the phase schema at the boundary. The engine only
/// inspects the handful of fields exposed by [`crate::core::control`].
pub type ControlJson = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of a single phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "failed",
        }
    }
}

/// Coarse job status used for listing and cross-process resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Discovery,
    Running,
    Paused,
    Checkpoint,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Discovery => "discovery",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Checkpoint => "checkpoint",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of human input a checkpoint asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    #[serde(rename = "human-verify")]
    HumanVerify,
    #[serde(rename = "decision")]
    Decision,
    #[serde(rename = "human-action")]
    HumanAction,
}

impl CheckpointKind {
    /// Parse a worker-supplied type string. Unknown values fall back to
    /// `human-verify`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim() {
            "decision" => CheckpointKind::Decision,
            "human-action" => CheckpointKind::HumanAction,
            _ => CheckpointKind::HumanVerify,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointKind::HumanVerify => "human-verify",
            CheckpointKind::Decision => "decision",
            CheckpointKind::HumanAction => "human-action",
        }
    }
}

/// Structured pause request emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "type")]
    pub kind: CheckpointKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// RFC 3339 timestamp set when a human resolves the checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

impl Checkpoint {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// History line recorded once the checkpoint has been resolved.
    pub fn history_entry(&self) -> String {
        format!(
            "[{}] {} → {}",
            self.kind.as_str(),
            self.message,
            self.resolution.as_deref().unwrap_or_default()
        )
    }
}

/// One step of the plan phase's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlanStep {
    pub id: String,
    pub goal: String,
    pub actions: Vec<String>,
    pub expected_files: Vec<String>,
    pub checks: Vec<String>,
}

/// Outcome of one verification gate command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub command: String,
    /// `-1` when the process was killed or terminated by a signal.
    pub exit_code: i32,
    /// Log path relative to the run directory.
    pub output_ref: String,
    pub passed: bool,
}

/// Action requested for a worker-listed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
        }
    }
}

/// One entry of the implement output's `files` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub content: String,
}

/// Category of a goal-backward verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    ArtifactExistence,
    StubDetection,
    Triviality,
    Wiring,
}

impl CheckCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckCategory::ArtifactExistence => "artifact_existence",
            CheckCategory::StubDetection => "stub_detection",
            CheckCategory::Triviality => "triviality",
            CheckCategory::Wiring => "wiring",
        }
    }
}

/// A single recorded goal-backward check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCheck {
    pub category: CheckCategory,
    pub file: String,
    pub passed: bool,
    pub detail: String,
}

/// Full goal-backward verification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VerifyReport {
    pub all_passed: bool,
    pub checks: Vec<VerifyCheck>,
    pub summary: String,
}

impl VerifyReport {
    pub fn failures(&self) -> impl Iterator<Item = &VerifyCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}
