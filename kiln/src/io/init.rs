//! Initialization helpers for `.kiln/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{PipelineSpec, write_spec};

macro_rules! default_file {
    ($rel:literal) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/", $rel))
    };
}

/// Prompt files written by `init`, keyed by their name under `prompts/`.
const DEFAULT_PROMPTS: [(&str, &str); 6] = [
    ("system", default_file!("prompts/system.md")),
    ("phase_context", default_file!("prompts/phase_context.md")),
    ("phase_plan", default_file!("prompts/phase_plan.md")),
    ("phase_implement", default_file!("prompts/phase_implement.md")),
    ("phase_verify", default_file!("prompts/phase_verify.md")),
    ("phase_deliver", default_file!("prompts/phase_deliver.md")),
];

/// Output schemas written by `init`, keyed by file name under `schemas/`.
const DEFAULT_SCHEMAS: [(&str, &str); 5] = [
    (
        "context_output.schema.json",
        default_file!("schemas/context_output.schema.json"),
    ),
    (
        "plan_output.schema.json",
        default_file!("schemas/plan_output.schema.json"),
    ),
    (
        "implement_output.schema.json",
        default_file!("schemas/implement_output.schema.json"),
    ),
    (
        "verify_output.schema.json",
        default_file!("schemas/verify_output.schema.json"),
    ),
    (
        "deliver_output.schema.json",
        default_file!("schemas/deliver_output.schema.json"),
    ),
];

const KILN_GITIGNORE: &str = "runs/\n";

/// All canonical paths within `.kiln/` for a project root.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    pub root: PathBuf,
    pub agent_dir: PathBuf,
    pub spec_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub schemas_dir: PathBuf,
    pub runs_dir: PathBuf,
    /// Optional project context injected into every prompt.
    pub agents_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl KilnPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent_dir = root.join(".kiln");
        Self {
            spec_path: agent_dir.join("spec.toml"),
            prompts_dir: agent_dir.join("prompts"),
            schemas_dir: agent_dir.join("schemas"),
            runs_dir: agent_dir.join("runs"),
            agents_path: agent_dir.join("AGENTS.md"),
            gitignore_path: agent_dir.join(".gitignore"),
            agent_dir,
            root,
        }
    }
}

/// Options for `init_kiln`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite existing kiln-owned files.
    pub force: bool,
}

/// Create `.kiln/` scaffolding in `root`.
///
/// Fails if `.kiln/` already exists unless `options.force` is set. Job
/// records under `runs/` are never touched.
pub fn init_kiln(root: &Path, options: &InitOptions) -> Result<KilnPaths> {
    let paths = KilnPaths::new(root);
    if paths.agent_dir.exists() && !paths.agent_dir.is_dir() {
        return Err(anyhow!("kiln init: .kiln exists but is not a directory"));
    }
    if paths.agent_dir.exists() && !options.force {
        return Err(anyhow!(
            "kiln init: .kiln already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.prompts_dir)?;
    create_dir(&paths.schemas_dir)?;
    create_dir(&paths.runs_dir)?;

    write_spec(&paths.spec_path, &PipelineSpec::default())?;
    for (name, contents) in DEFAULT_PROMPTS {
        write_file(&paths.prompts_dir.join(format!("{name}.md")), contents)?;
    }
    for (name, contents) in DEFAULT_SCHEMAS {
        write_file(&paths.schemas_dir.join(name), contents)?;
    }
    write_file(&paths.gitignore_path, KILN_GITIGNORE)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
