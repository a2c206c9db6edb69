//! Phase output schemas: loading and validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::types::ControlJson;

/// A compiled JSON Schema plus its source text (quoted into prompts).
pub struct PhaseSchema {
    /// Reference as written in the spec, relative to the agent directory.
    pub reference: String,
    pub raw: String,
    validator: Validator,
}

impl std::fmt::Debug for PhaseSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseSchema")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl PhaseSchema {
    /// Compile a schema from its JSON text.
    pub fn from_str(reference: &str, raw: &str) -> Result<Self> {
        let schema: Value = serde_json::from_str(raw)
            .with_context(|| format!("parse schema {reference}"))?;
        let validator =
            validator_for(&schema).map_err(|err| anyhow!("invalid schema {reference}: {err}"))?;
        Ok(Self {
            reference: reference.to_string(),
            raw: raw.to_string(),
            validator,
        })
    }

    /// Validate a control object, listing every violation on failure.
    pub fn validate(&self, control: &ControlJson) -> Result<()> {
        let instance = Value::Object(control.clone());
        let messages: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!(
                "output does not match schema {}:\n- {}",
                self.reference,
                messages.join("\n- ")
            );
        }
        Ok(())
    }
}

/// Load the schema a phase references, relative to `agent_dir`.
pub fn load_schema(agent_dir: &Path, reference: &str) -> Result<PhaseSchema> {
    let path = agent_dir.join(reference);
    debug!(path = %path.display(), "loading schema");
    let raw =
        fs::read_to_string(&path).with_context(|| format!("read schema {}", path.display()))?;
    PhaseSchema::from_str(reference, &raw)
}
