//! Prompt builder for worker calls.
//!
//! Templates are rendered with minijinja and split into marked sections so a
//! prompt that outgrows its byte budget can shed low-value context first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::PlanStep;

const PHASE_TEMPLATE: &str = include_str!("prompts/phase.md");
const CHUNK_TEMPLATE: &str = include_str!("prompts/chunk.md");

/// Order in which droppable sections are removed once over budget.
const DROP_ORDER: [&str; 4] = ["diff", "agents", "prior", "cumulative"];

/// Shown instead of an empty diff.
const NO_DIFF: &str = "<none>";

/// Inputs shared by every worker prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub phase: String,
    /// Contents of `.kiln/AGENTS.md`, when present.
    pub agents: Option<String>,
    pub system: String,
    pub phase_instructions: String,
    pub task: String,
    /// Raw JSON Schema text the reply must satisfy.
    pub schema: String,
    pub diff: String,
    /// Validated outputs of phases that already passed, in pipeline order.
    pub prior_outputs: Vec<PriorOutput>,
    /// Failure summary from the last verify attempt.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorOutput {
    pub phase: String,
    /// Pretty-printed control JSON.
    pub json: String,
}

/// Chunk-specific prompt inputs.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInputs<'a> {
    /// 0-based chunk index.
    pub index: usize,
    pub total: usize,
    pub steps: &'a [PlanStep],
    pub completed_files: &'a [String],
    pub cumulative_diff: &'a str,
    pub resolutions: &'a [String],
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("phase", PHASE_TEMPLATE)
            .context("load phase template")?;
        env.add_template("chunk", CHUNK_TEMPLATE)
            .context("load chunk template")?;
        Ok(Self { env })
    }

    fn render_phase(&self, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template("phase")?;
        let rendered = template.render(context! {
            agents => trimmed(input.agents.as_deref()),
            system => input.system.trim(),
            phase => input.phase.as_str(),
            phase_instructions => input.phase_instructions.trim(),
            task => input.task.trim(),
            prior => &input.prior_outputs,
            feedback => trimmed(input.feedback.as_deref()),
            diff => diff_or_none(&input.diff),
            schema => input.schema.trim(),
        })?;
        Ok(rendered)
    }

    fn render_chunk(&self, input: &PromptInputs, chunk: &ChunkInputs<'_>) -> Result<String> {
        let template = self.env.get_template("chunk")?;
        let rendered = template.render(context! {
            agents => trimmed(input.agents.as_deref()),
            system => input.system.trim(),
            phase => input.phase.as_str(),
            phase_instructions => input.phase_instructions.trim(),
            task => input.task.trim(),
            chunk_number => chunk.index + 1,
            total_chunks => chunk.total,
            steps => chunk.steps,
            completed_files => chunk.completed_files,
            cumulative_diff => diff_or_none(chunk.cumulative_diff),
            resolutions => chunk.resolutions,
            feedback => trimmed(input.feedback.as_deref()),
            schema => input.schema.trim(),
        })?;
        Ok(rendered)
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn diff_or_none(diff: &str) -> &str {
    let diff = diff.trim();
    if diff.is_empty() { NO_DIFF } else { diff }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never dropped.
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, content_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(rendered.len());
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in [`DROP_ORDER`] until the prompt fits.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total > budget {
        warn!(total, budget, "prompt exceeds budget after dropping sections");
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

/// Builds worker prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Prompt for a single-call phase attempt.
    pub fn build_phase(&self, input: &PromptInputs) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_phase(input)
            .with_context(|| format!("render prompt for phase '{}'", input.phase))?;
        Ok(self.fit(&rendered))
    }

    /// Prompt for one chunk of a chunked implement attempt.
    pub fn build_chunk(&self, input: &PromptInputs, chunk: &ChunkInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?
            .render_chunk(input, chunk)
            .with_context(|| format!("render prompt for chunk {}", chunk.index + 1))?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

/// Read `<agent_dir>/prompts/<name>.md`.
pub fn load_prompt(agent_dir: &Path, name: &str) -> Result<String> {
    let path = agent_dir.join("prompts").join(format!("{name}.md"));
    fs::read_to_string(&path).with_context(|| {
        format!(
            "read prompt {} (run `kiln init` to install defaults)",
            path.display()
        )
    })
}

/// Read file contents if it exists, returning `None` for missing files.
pub fn read_optional(path: impl Into<PathBuf>) -> Result<Option<String>> {
    let path = path.into();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("read prompt input {}", path.display()))?;
    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PromptInputs {
        PromptInputs {
            phase: "implement".to_string(),
            agents: Some("Use Go 1.22.".to_string()),
            system: "You are a careful engineer.".to_string(),
            phase_instructions: "Write the code.".to_string(),
            task: "Build a greeting service".to_string(),
            schema: "{\"type\": \"object\"}".to_string(),
            diff: String::new(),
            prior_outputs: vec![PriorOutput {
                phase: "plan".to_string(),
                json: "{\"phase\": \"plan\"}".to_string(),
            }],
            feedback: None,
        }
    }

    fn step(id: &str, file: &str) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            goal: format!("goal for {id}"),
            actions: vec![format!("action for {id}")],
            expected_files: vec![file.to_string()],
            checks: Vec::new(),
        }
    }

    /// Sections render in a stable order with empty ones omitted.
    #[test]
    fn phase_prompt_ordering_is_stable() {
        let prompt = PromptBuilder::new(100_000)
            .build_phase(&inputs())
            .expect("build");
        let agents = prompt.find("## Project Context").expect("agents");
        let system = prompt.find("You are a careful engineer.").expect("system");
        let task = prompt.find("## Task").expect("task");
        let prior = prompt.find("### plan").expect("prior");
        let diff = prompt.find("## Current Git Diff").expect("diff");
        let schema = prompt.find("## Required JSON Schema").expect("schema");
        assert!(agents < system && system < task && task < prior);
        assert!(prior < diff && diff < schema);
        assert!(prompt.contains("<none>"));
        assert!(!prompt.contains("Verification Feedback"));
        assert!(!prompt.contains("<!-- section"));
    }

    #[test]
    fn feedback_is_included_when_present() {
        let mut input = inputs();
        input.feedback = Some("gate unit_tests failed".to_string());
        let prompt = PromptBuilder::new(100_000)
            .build_phase(&input)
            .expect("build");
        assert!(prompt.contains("## Verification Feedback"));
        assert!(prompt.contains("gate unit_tests failed"));
    }

    /// The chunk prompt carries only its own steps plus prior progress and resolutions.
    #[test]
    fn chunk_prompt_includes_steps_progress_and_resolutions() {
        let steps = vec![step("s4", "api.go"), step("s5", "db.go")];
        let completed = vec!["main.go".to_string()];
        let resolutions = vec!["[decision] Which db? → sqlite".to_string()];
        let prompt = PromptBuilder::new(100_000)
            .build_chunk(
                &inputs(),
                &ChunkInputs {
                    index: 1,
                    total: 3,
                    steps: &steps,
                    completed_files: &completed,
                    cumulative_diff: "+package main",
                    resolutions: &resolutions,
                },
            )
            .expect("build");

        assert!(prompt.contains("## Chunk 2 of 3"));
        assert!(prompt.contains("### Step s4: goal for s4"));
        assert!(prompt.contains("- api.go"));
        assert!(prompt.contains("- main.go"));
        assert!(prompt.contains("+package main"));
        assert!(prompt.contains("[decision] Which db? → sqlite"));
        assert!(prompt.contains("\"checkpoint\""));
    }

    #[test]
    fn first_chunk_says_no_prior_changes() {
        let steps = vec![step("s1", "main.go")];
        let prompt = PromptBuilder::new(100_000)
            .build_chunk(
                &inputs(),
                &ChunkInputs {
                    index: 0,
                    total: 1,
                    steps: &steps,
                    completed_files: &[],
                    cumulative_diff: "",
                    resolutions: &[],
                },
            )
            .expect("build");
        assert!(prompt.contains("This is the first chunk. No prior changes."));
        assert!(!prompt.contains("Previous Checkpoint Resolutions"));
    }

    /// Tight budgets drop the diff and project context before anything required.
    #[test]
    fn budget_drops_less_critical_sections_first() {
        let mut input = inputs();
        input.diff = "+line\n".repeat(500);
        input.agents = Some("context ".repeat(200));
        let prompt = PromptBuilder::new(1_200)
            .build_phase(&input)
            .expect("build");
        assert!(!prompt.contains("## Current Git Diff"));
        assert!(!prompt.contains("## Project Context"));
        assert!(prompt.contains("## Task"));
        assert!(prompt.contains("## Required JSON Schema"));
        assert!(prompt.contains("## Output"));
    }

    /// Checkpoint answers and verify feedback survive a budget that sheds
    /// every droppable section.
    #[test]
    fn budget_keeps_resolutions_and_feedback() {
        let mut input = inputs();
        input.feedback = Some("wiring: greet is never called".to_string());
        input.agents = Some("context ".repeat(200));
        let steps = vec![step("s2", "greet.py")];
        let completed = vec!["main.py".to_string()];
        let resolutions = vec!["[decision] Which db? → sqlite".to_string()];
        let cumulative = "+import greet\n".repeat(300);
        let prompt = PromptBuilder::new(500)
            .build_chunk(
                &input,
                &ChunkInputs {
                    index: 1,
                    total: 2,
                    steps: &steps,
                    completed_files: &completed,
                    cumulative_diff: &cumulative,
                    resolutions: &resolutions,
                },
            )
            .expect("build");

        assert!(!prompt.contains("## Project Context"));
        assert!(!prompt.contains("+import greet"));
        assert!(prompt.contains("[decision] Which db? → sqlite"));
        assert!(prompt.contains("wiring: greet is never called"));
    }
}
