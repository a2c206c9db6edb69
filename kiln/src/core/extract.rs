//! Pull a single JSON object (and optional checkpoint) out of worker text.
//!
//! Fenced ```json blocks win over bare objects. When several distinct
//! objects remain the output is rejected as ambiguous instead of guessing.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde_json::Value;

use crate::core::types::{Checkpoint, CheckpointKind, ControlJson};
use crate::error::AmbiguousOutput;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

static INLINE_CHECKPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)\{\s*"checkpoint"\s*:\s*(\{[^{}]*\})\s*\}"#).unwrap()
});

/// Extract the single JSON object carried by `text`.
pub fn extract_json(text: &str) -> Result<ControlJson> {
    let mut last_error = None;
    let mut candidates = Vec::new();
    for caps in FENCED_RE.captures_iter(text) {
        match serde_json::from_str::<Value>(&caps[1]) {
            Ok(Value::Object(map)) => candidates.push(map),
            Ok(_) => {}
            Err(err) => last_error = Some(err),
        }
    }
    if candidates.is_empty() {
        candidates = bare_objects(text, &mut last_error);
    }
    select_single(candidates, last_error)
}

/// Scan `text` for balanced top-level `{...}` spans that parse as objects.
///
/// A `{` that never closes, or whose span does not parse, is treated as prose
/// and scanning resumes right after it.
fn bare_objects(text: &str, last_error: &mut Option<serde_json::Error>) -> Vec<ControlJson> {
    let bytes = text.as_bytes();
    let mut objects = Vec::new();
    let mut pos = 0;
    while let Some(offset) = bytes[pos..].iter().position(|&b| b == b'{') {
        let start = pos + offset;
        let Some(end) = matching_brace(bytes, start) else {
            pos = start + 1;
            continue;
        };
        match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(Value::Object(map)) => {
                objects.push(map);
                pos = end + 1;
            }
            Ok(_) => pos = start + 1,
            Err(err) => {
                *last_error = Some(err);
                pos = start + 1;
            }
        }
    }
    objects
}

/// Index of the `}` closing the `{` at `start`, honouring JSON strings.
fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn select_single(
    candidates: Vec<ControlJson>,
    last_error: Option<serde_json::Error>,
) -> Result<ControlJson> {
    let mut distinct: Vec<ControlJson> = Vec::new();
    for candidate in candidates {
        if !distinct.contains(&candidate) {
            distinct.push(candidate);
        }
    }
    if distinct.iter().any(|map| !map.is_empty()) {
        distinct.retain(|map| !map.is_empty());
    }
    match distinct.len() {
        0 => match last_error {
            Some(err) => Err(anyhow!("no valid JSON object in worker output: {err}")),
            None => Err(anyhow!("no JSON object found in worker output")),
        },
        1 => Ok(distinct.remove(0)),
        count => Err(AmbiguousOutput { count }.into()),
    }
}

/// Detect a checkpoint request.
///
/// Prefers the structured `checkpoint` field of the extracted object and
/// falls back to an inline `{"checkpoint": {...}}` block in the raw text. A
/// checkpoint without a message is ignored.
pub fn detect_checkpoint(raw: &str, control: Option<&ControlJson>) -> Option<Checkpoint> {
    if let Some(fields) = control
        .and_then(|map| map.get("checkpoint"))
        .and_then(Value::as_object)
    {
        return checkpoint_from_fields(fields);
    }
    let caps = INLINE_CHECKPOINT_RE.captures(raw)?;
    match serde_json::from_str::<Value>(&caps[1]) {
        Ok(Value::Object(fields)) => checkpoint_from_fields(&fields),
        _ => None,
    }
}

fn checkpoint_from_fields(fields: &serde_json::Map<String, Value>) -> Option<Checkpoint> {
    let message = fields
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())?;
    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .map(CheckpointKind::parse_lenient)
        .unwrap_or(CheckpointKind::HumanVerify);
    let options = fields
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(Checkpoint {
        kind,
        message: message.to_string(),
        options,
        resolution: None,
        resolved_at: None,
    })
}
