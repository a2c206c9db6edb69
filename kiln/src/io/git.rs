//! Git adapter used to show the worker what has changed so far.
//!
//! Diffs are context for prompts, not a correctness input: outside a git
//! repository (or without git installed) they are simply empty.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Unstaged diff, staged diff and the list of untracked files.
    ///
    /// Returns an empty string when git is unavailable or the directory is
    /// not a repository.
    #[instrument(skip_all)]
    pub fn cumulative_diff(&self) -> String {
        match self.try_cumulative_diff() {
            Ok(diff) => diff,
            Err(err) => {
                debug!(err = %err, "git diff unavailable");
                String::new()
            }
        }
    }

    fn try_cumulative_diff(&self) -> Result<String> {
        let mut sections = Vec::new();
        let unstaged = self.run_capture(&["diff"])?;
        if !unstaged.trim().is_empty() {
            sections.push(unstaged.trim_end().to_string());
        }
        let staged = self.run_capture(&["diff", "--cached"])?;
        if !staged.trim().is_empty() {
            sections.push(staged.trim_end().to_string());
        }
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        let untracked: Vec<&str> = untracked
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if !untracked.is_empty() {
            let mut listing = String::from("Untracked files:");
            for path in untracked {
                listing.push_str("\n  ");
                listing.push_str(path);
            }
            sections.push(listing);
        }
        Ok(sections.join("\n\n"))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
