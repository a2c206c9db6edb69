//! Applying worker-requested file changes to the repository.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::core::types::{FileAction, FileChange};
use crate::events::{EngineEvent, EventSink};

/// Apply `changes` in the order given, relative to `repo_root`.
///
/// Create and modify write the full content (creating parent directories);
/// deleting a file that does not exist is not an error.
#[instrument(skip_all, fields(changes = changes.len()))]
pub fn apply_file_changes(
    repo_root: &Path,
    changes: &[FileChange],
    events: &EventSink,
) -> Result<()> {
    for change in changes {
        let target = resolve_in_repo(repo_root, &change.path)?;
        match change.action {
            FileAction::Create | FileAction::Modify => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&target, &change.content)
                    .with_context(|| format!("write {}", target.display()))?;
            }
            FileAction::Delete => match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %change.path, "delete target already absent");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("delete {}", target.display()));
                }
            },
        }
        debug!(path = %change.path, action = change.action.as_str(), "applied file change");
        events.emit(EngineEvent::FileApplied {
            path: change.path.clone(),
            action: change.action,
        });
    }
    Ok(())
}

/// Join a worker-supplied relative path onto the repo root, refusing paths
/// that are absolute or climb out of the repository.
fn resolve_in_repo(repo_root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if relative.trim().is_empty() {
        bail!("file change has an empty path");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("file path '{relative}' escapes the repository");
            }
        }
    }
    Ok(repo_root.join(path))
}
