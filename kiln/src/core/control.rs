//! Typed views over the worker's free-form control JSON.
//!
//! Only the fields the engine acts on are interpreted here: `narration`,
//! `checkpoint`, `files`, `notes`, `evidence`, and the plan phase's
//! `plan.steps`. Everything else passes through untouched.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ControlJson, FileAction, FileChange, PlanStep};

/// Non-empty narration text, if the worker supplied one.
pub fn narration(control: &ControlJson) -> Option<&str> {
    control
        .get("narration")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

/// Non-empty notes text, if present.
pub fn notes(control: &ControlJson) -> Option<&str> {
    control
        .get("notes")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub fn evidence(control: &ControlJson) -> &[Value] {
    control
        .get("evidence")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Raw `files` entries as the worker listed them.
pub fn raw_files(control: &ControlJson) -> &[Value] {
    control
        .get("files")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Parse the `files` list into ordered file changes.
///
/// A missing list yields no changes; a malformed entry is an error.
pub fn file_changes(control: &ControlJson) -> Result<Vec<FileChange>> {
    raw_files(control)
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            serde_json::from_value::<FileChange>(entry.clone())
                .with_context(|| format!("parse files[{idx}]"))
        })
        .collect()
}

/// Paths the implement output wrote (everything except deletions).
pub fn implemented_paths(control: &ControlJson) -> Vec<String> {
    raw_files(control)
        .iter()
        .filter_map(|entry| {
            let path = entry.get("path")?.as_str()?;
            let action = entry.get("action").and_then(Value::as_str);
            (action != Some(FileAction::Delete.as_str())).then(|| path.to_string())
        })
        .collect()
}

/// Extract `plan.steps` from the plan phase output.
///
/// Errors when the `plan` object or its `steps` array is missing. An empty
/// array yields an empty list.
pub fn plan_steps(control: &ControlJson) -> Result<Vec<PlanStep>> {
    let plan = control
        .get("plan")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("plan output has no 'plan' object"))?;
    let steps = plan
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("plan output has no 'plan.steps' array"))?;
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            serde_json::from_value::<PlanStep>(step.clone())
                .with_context(|| format!("parse plan.steps[{idx}]"))
        })
        .collect()
}

/// Union of every step's expected files, in plan order.
pub fn planned_files(steps: &[PlanStep]) -> Vec<String> {
    steps
        .iter()
        .flat_map(|step| step.expected_files.iter().cloned())
        .collect()
}

/// Outputs collected across the chunks of one implement attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChunkAccumulator {
    pub files: Vec<Value>,
    pub evidence: Vec<Value>,
    pub notes: Vec<String>,
}

impl ChunkAccumulator {
    /// Fold one chunk's validated output in. `chunk_number` is 1-based.
    pub fn absorb(&mut self, chunk_number: usize, control: &ControlJson) {
        self.files.extend(raw_files(control).iter().cloned());
        self.evidence.extend(evidence(control).iter().cloned());
        if let Some(text) = notes(control) {
            self.notes.push(format!("Chunk {chunk_number}: {text}"));
        }
    }

    /// Synthetic implement output equivalent to a single unchunked call.
    pub fn to_control(&self) -> ControlJson {
        let mut control = ControlJson::new();
        control.insert("phase".to_string(), Value::from("implement"));
        control.insert("files".to_string(), Value::Array(self.files.clone()));
        control.insert("notes".to_string(), Value::from(self.notes.join("\n")));
        control.insert("evidence".to_string(), Value::Array(self.evidence.clone()));
        control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn control(value: Value) -> ControlJson {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn plan_steps_requires_plan_object() {
        let err = plan_steps(&control(json!({"phase": "plan"}))).unwrap_err();
        assert!(err.to_string().contains("'plan'"));
    }

    #[test]
    fn plan_steps_requires_steps_array() {
        let err = plan_steps(&control(json!({"plan": {"summary": "x"}}))).unwrap_err();
        assert!(err.to_string().contains("plan.steps"));
    }

    #[test]
    fn plan_steps_accepts_empty_list() {
        let steps = plan_steps(&control(json!({"plan": {"steps": []}}))).expect("steps");
        assert!(steps.is_empty());
    }

    #[test]
    fn plan_steps_parse_fields_with_defaults() {
        let steps = plan_steps(&control(json!({
            "plan": {"steps": [
                {"id": "s1", "goal": "add api", "actions": ["write"], "expected_files": ["api.go"]},
                {"id": "s2", "goal": "wire it"}
            ]}
        })))
        .expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].expected_files, vec!["api.go".to_string()]);
        assert!(steps[1].actions.is_empty());
        assert_eq!(planned_files(&steps), vec!["api.go".to_string()]);
    }

    #[test]
    fn implemented_paths_skip_deletions() {
        let output = control(json!({
            "files": [
                {"path": "a.go", "action": "create", "content": "x"},
                {"path": "b.go", "action": "delete"},
                {"path": "c.go", "action": "modify", "content": "y"}
            ]
        }));
        assert_eq!(implemented_paths(&output), vec!["a.go", "c.go"]);
        let changes = file_changes(&output).expect("changes");
        assert_eq!(changes[1].action, FileAction::Delete);
        assert_eq!(changes[1].content, "");
    }

    #[test]
    fn accumulator_merges_chunks_in_order() {
        let mut acc = ChunkAccumulator::default();
        acc.absorb(
            1,
            &control(json!({
                "files": [{"path": "a.go", "action": "create", "content": "a"}],
                "notes": "first",
                "evidence": [{"kind": "file", "ref": "a.go"}]
            })),
        );
        acc.absorb(
            2,
            &control(json!({
                "files": [{"path": "b.go", "action": "create", "content": "b"}],
                "notes": "  "
            })),
        );

        let merged = acc.to_control();
        assert_eq!(merged["phase"], json!("implement"));
        assert_eq!(implemented_paths(&merged), vec!["a.go", "b.go"]);
        assert_eq!(merged["notes"], json!("Chunk 1: first"));
        assert_eq!(evidence(&merged).len(), 1);
    }
}
