//! Test-only fixtures: a scripted worker, canned phase outputs and a
//! temporary project with `.kiln/` initialised.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::error::{PauseReason, PausedError};
use crate::io::config::{PipelineSpec, load_spec, write_spec};
use crate::io::init::{InitOptions, KilnPaths, init_kiln};
use crate::io::worker::{Worker, WorkerRequest};

/// One queued reply of a [`ScriptedWorker`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text as the worker's stdout.
    Output(String),
    /// Cancel the request's token and report the call as paused, as if the
    /// user interrupted the worker mid-flight.
    Cancel,
    /// Fail with this message.
    Fail(String),
}

/// Worker returning queued replies in order and recording every request.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Worker that answers with each output in turn.
    pub fn outputs<S: Into<String>>(outputs: impl IntoIterator<Item = S>) -> Self {
        Self::new(outputs.into_iter().map(|out| ScriptedReply::Output(out.into())))
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.borrow().clone()
    }

    /// Phase of every request so far, in call order.
    pub fn phases(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.phase.clone())
            .collect()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.requests
            .borrow()
            .last()
            .map(|request| request.prompt.clone())
    }
}

impl Worker for ScriptedWorker {
    fn invoke(&self, request: &WorkerRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted worker has no reply for phase {}", request.phase))?;
        match reply {
            ScriptedReply::Output(text) => Ok(text),
            ScriptedReply::Cancel => {
                request.cancel.cancel();
                Err(PausedError {
                    reason: PauseReason::Cancelled,
                }
                .into())
            }
            ScriptedReply::Fail(message) => Err(anyhow!(message)),
        }
    }
}

/// A temporary repository with default `.kiln/` scaffolding.
pub struct TestProject {
    pub temp: TempDir,
    pub paths: KilnPaths,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_kiln(temp.path(), &InitOptions::default()).expect("init kiln");
        Self { temp, paths }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Load, modify and rewrite `.kiln/spec.toml`.
    pub fn edit_spec(&self, edit: impl FnOnce(&mut PipelineSpec)) {
        let mut spec = load_spec(&self.paths.spec_path).expect("load spec");
        edit(&mut spec);
        write_spec(&self.paths.spec_path, &spec).expect("write spec");
    }

    /// Require one gate named `name` running `command`.
    pub fn require_gate(&self, name: &str, command: &str) {
        self.edit_spec(|spec| {
            spec.commands.insert(name.to_string(), command.to_string());
            spec.gates.required_checks.push(name.to_string());
        });
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root().join(rel)).expect("read project file")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Python module with one exported function, used by [`WIRED_MAIN_PY`].
pub const WIRED_GREET_PY: &str = "def greet(name):\n    message = \"hello, \" + name\n    return message\n";

/// Entry point importing [`WIRED_GREET_PY`].
pub const WIRED_MAIN_PY: &str =
    "from greet import greet\n\nif __name__ == \"__main__\":\n    print(greet(\"world\"))\n";

/// Wrap `value` the way a model usually answers: prose, then a fenced block.
pub fn fenced(value: &Value) -> String {
    format!(
        "Here is the result.\n\n```json\n{}\n```\n",
        serde_json::to_string_pretty(value).expect("serialize canned output")
    )
}

pub fn context_output() -> String {
    fenced(&json!({
        "phase": "context",
        "narration": "Read the project layout.",
        "summary": "Small Python project.",
        "relevant_files": [],
    }))
}

/// Plan whose steps each expect one file: `(step id, expected file)`.
pub fn plan_output(steps: &[(&str, &str)]) -> String {
    let steps: Vec<Value> = steps
        .iter()
        .map(|(id, file)| {
            json!({
                "id": id,
                "goal": format!("write {file}"),
                "actions": [format!("create {file}")],
                "expected_files": [file],
            })
        })
        .collect();
    fenced(&json!({
        "phase": "plan",
        "narration": "Planned the change.",
        "plan": { "steps": steps },
    }))
}

/// Implement output creating each `(path, content)` pair.
pub fn implement_output(files: &[(&str, &str)]) -> String {
    let files: Vec<Value> = files
        .iter()
        .map(|(path, content)| json!({ "path": path, "action": "create", "content": content }))
        .collect();
    fenced(&json!({
        "phase": "implement",
        "narration": "Wrote the files.",
        "files": files,
        "evidence": [],
    }))
}

pub fn verify_output() -> String {
    fenced(&json!({ "phase": "verify", "passed": true, "findings": [] }))
}

pub fn deliver_output() -> String {
    fenced(&json!({
        "phase": "deliver",
        "narration": "Done.",
        "summary": "Added a greeting module.",
    }))
}

/// A chunk reply asking for human input instead of doing the work.
pub fn checkpoint_output(kind: &str, message: &str, options: &[&str]) -> String {
    fenced(&json!({
        "checkpoint": { "type": kind, "message": message, "options": options },
    }))
}
