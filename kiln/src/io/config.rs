//! Pipeline configuration stored under `.kiln/spec.toml`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONTEXT_PHASE: &str = "context";
pub const PLAN_PHASE: &str = "plan";
pub const IMPLEMENT_PHASE: &str = "implement";
pub const VERIFY_PHASE: &str = "verify";
pub const DELIVER_PHASE: &str = "deliver";

/// The canonical pipeline, in order.
pub const CANONICAL_PHASES: [&str; 5] = [
    CONTEXT_PHASE,
    PLAN_PHASE,
    IMPLEMENT_PHASE,
    VERIFY_PHASE,
    DELIVER_PHASE,
];

/// Static pipeline definition (TOML).
///
/// Loaded once per run and copied into the job record, so a resumed job keeps
/// the configuration it started with. Missing sections fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSpec {
    pub version: String,
    pub name: String,

    /// Gate name -> shell command.
    pub commands: BTreeMap<String, String>,

    pub limits: Limits,
    pub gates: GateSettings,
    pub worker: WorkerSettings,
    pub prompt: PromptSettings,

    /// Ordered phases. Each names the JSON Schema its output must satisfy.
    pub phases: Vec<PhaseDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    pub max_total_iterations: u32,
    pub max_phase_iterations: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_total_iterations: 25,
            max_phase_iterations: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateSettings {
    /// Gate names run in order during verify. Each needs an entry in `commands`.
    pub required_checks: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate gate logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            required_checks: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker command line; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Wall-clock budget per worker call. Exceeding it pauses the run.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptSettings {
    /// Droppable prompt sections are removed once a prompt exceeds this size.
    pub budget_bytes: usize,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            budget_bytes: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDef {
    pub id: String,
    /// Schema path relative to the agent directory.
    pub required_outputs_schema: String,
}

impl PhaseDef {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            required_outputs_schema: format!("schemas/{id}_output.schema.json"),
        }
    }
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            name: "kiln".to_string(),
            commands: BTreeMap::new(),
            limits: Limits::default(),
            gates: GateSettings::default(),
            worker: WorkerSettings::default(),
            prompt: PromptSettings::default(),
            phases: CANONICAL_PHASES.iter().map(|id| PhaseDef::new(id)).collect(),
        }
    }
}

impl PipelineSpec {
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_total_iterations == 0 {
            return Err(anyhow!("limits.max_total_iterations must be > 0"));
        }
        if self.limits.max_phase_iterations == 0 {
            return Err(anyhow!("limits.max_phase_iterations must be > 0"));
        }
        if self.gates.timeout_secs == 0 {
            return Err(anyhow!("gates.timeout_secs must be > 0"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.phases.is_empty() {
            return Err(anyhow!("at least one phase must be configured"));
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(anyhow!("phase id must not be empty"));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(anyhow!("duplicate phase id '{}'", phase.id));
            }
            if phase.required_outputs_schema.trim().is_empty() {
                return Err(anyhow!("phase '{}' has no output schema", phase.id));
            }
        }
        for check in &self.gates.required_checks {
            if !self.commands.contains_key(check) {
                return Err(anyhow!("gate '{check}' has no entry in [commands]"));
            }
        }
        Ok(())
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|phase| phase.id == id)
    }
}

/// Load the pipeline spec from a TOML file.
///
/// If the file is missing, returns `PipelineSpec::default()`.
pub fn load_spec(path: &Path) -> Result<PipelineSpec> {
    if !path.exists() {
        debug!(path = %path.display(), "spec missing, using defaults");
        let spec = PipelineSpec::default();
        spec.validate()?;
        return Ok(spec);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let spec: PipelineSpec =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("invalid spec {}", path.display()))?;
    Ok(spec)
}

/// Atomically write the spec to disk (temp file + rename).
pub fn write_spec(path: &Path, spec: &PipelineSpec) -> Result<()> {
    spec.validate()?;
    let mut buf = toml::to_string_pretty(spec).context("serialize spec toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("spec path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp spec {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace spec {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = load_spec(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(spec, PipelineSpec::default());
        assert_eq!(spec.limits.max_total_iterations, 25);
        assert_eq!(spec.limits.max_phase_iterations, 6);
        let ids: Vec<&str> = spec.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, CANONICAL_PHASES);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("spec.toml");
        let mut spec = PipelineSpec::default();
        spec.commands
            .insert("unit_tests".to_string(), "go test ./...".to_string());
        spec.gates.required_checks = vec!["unit_tests".to_string()];
        write_spec(&path, &spec).expect("write");
        let loaded = load_spec(&path).expect("load");
        assert_eq!(loaded, spec);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("spec.toml");
        fs::write(&path, "[limits]\nmax_phase_iterations = 2\n").expect("write");
        let spec = load_spec(&path).expect("load");
        assert_eq!(spec.limits.max_phase_iterations, 2);
        assert_eq!(spec.limits.max_total_iterations, 25);
        assert_eq!(spec.phases.len(), 5);
    }

    #[test]
    fn required_check_without_command_is_rejected() {
        let mut spec = PipelineSpec::default();
        spec.gates.required_checks = vec!["lint".to_string()];
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("gate 'lint'"));
    }

    #[test]
    fn duplicate_phase_ids_are_rejected() {
        let mut spec = PipelineSpec::default();
        spec.phases.push(PhaseDef::new(PLAN_PHASE));
        assert!(spec.validate().is_err());
    }
}
