//! Goal-backward verification of planned and implemented files.
//!
//! Gates catch code that fails to build or test. This audit catches work
//! that compiles but does not do what the plan promised: planned files that
//! were never written, placeholder bodies, near-empty files and exports that
//! nothing uses. It only reads the repository.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::exports::{Language, exported_symbols};
use crate::core::stubs::{find_stubs, triviality};
use crate::core::types::{CheckCategory, VerifyCheck, VerifyReport};

/// Most repository files read for the wiring check.
const MAX_SCAN_FILES: usize = 500;

const SOURCE_EXTENSIONS: [&str; 12] = [
    "go", "py", "js", "jsx", "ts", "tsx", "rs", "java", "rb", "php", "vue", "svelte",
];

const SKIP_DIRS: [&str; 9] = [
    "node_modules",
    ".git",
    "vendor",
    "__pycache__",
    "dist",
    "build",
    ".next",
    "target",
    ".kiln",
];

/// Audits files relative to a repository root.
#[derive(Debug, Clone)]
pub struct GoalBackwardVerifier {
    repo_root: PathBuf,
}

impl GoalBackwardVerifier {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Check the union of `planned` and `implemented` paths.
    ///
    /// Every check is recorded, passing or not; the report passes only when
    /// all of them do. With no files at all there is nothing to fail.
    #[instrument(skip_all, fields(planned = planned.len(), implemented = implemented.len()))]
    pub fn verify(&self, planned: &[String], implemented: &[String]) -> VerifyReport {
        let files: BTreeSet<String> = planned
            .iter()
            .chain(implemented)
            .map(String::as_str)
            .map(normalize)
            .filter(|path| !path.is_empty())
            .collect();
        if files.is_empty() {
            return VerifyReport {
                all_passed: true,
                checks: Vec::new(),
                summary: "No files to verify (no plan/implement output found)".to_string(),
            };
        }

        let mut checks = Vec::new();
        let mut existing: BTreeMap<&str, String> = BTreeMap::new();
        for file in files.iter().map(String::as_str) {
            let path = self.repo_root.join(file);
            if !path.is_file() {
                checks.push(check(
                    CheckCategory::ArtifactExistence,
                    file,
                    false,
                    "file does not exist on disk",
                ));
                continue;
            }
            checks.push(check(CheckCategory::ArtifactExistence, file, true, "exists"));
            match fs::read(&path) {
                Ok(bytes) => {
                    existing.insert(file, String::from_utf8_lossy(&bytes).into_owned());
                }
                Err(err) => debug!(file, err = %err, "unreadable file skipped"),
            }
        }

        for (&file, content) in &existing {
            let stubs = find_stubs(content);
            if stubs.is_empty() {
                checks.push(check(
                    CheckCategory::StubDetection,
                    file,
                    true,
                    "no stubs detected",
                ));
            } else {
                let hits: Vec<String> = stubs.iter().map(|hit| hit.describe()).collect();
                checks.push(check(
                    CheckCategory::StubDetection,
                    file,
                    false,
                    &format!("found {} stub(s): {}", hits.len(), hits.join("; ")),
                ));
            }

            match triviality(content) {
                Some(detail) => checks.push(check(CheckCategory::Triviality, file, false, &detail)),
                None => checks.push(check(
                    CheckCategory::Triviality,
                    file,
                    true,
                    "has substantive content",
                )),
            }
        }

        checks.extend(self.check_wiring(&existing));

        let failed = checks.iter().filter(|check| !check.passed).count();
        let passed = checks.len() - failed;
        let summary = format!(
            "Goal-backward verification: {passed} passed, {failed} failed across {} files",
            files.len()
        );
        debug!(passed, failed, "goal-backward verification finished");
        VerifyReport {
            all_passed: failed == 0,
            checks,
            summary,
        }
    }

    /// One failed check per exported symbol that no other source file
    /// mentions, and one passing check per file whose exports are all used.
    fn check_wiring(&self, existing: &BTreeMap<&str, String>) -> Vec<VerifyCheck> {
        let exports: Vec<(&str, Vec<String>)> = existing
            .iter()
            .filter_map(|(&file, content)| {
                let ext = Path::new(file).extension()?.to_str()?;
                let symbols = exported_symbols(Language::from_extension(ext)?, content);
                (!symbols.is_empty()).then_some((file, symbols))
            })
            .collect();
        if exports.is_empty() {
            return Vec::new();
        }

        let corpus = self.scan_sources();
        let mut checks = Vec::new();
        for (file, symbols) in exports {
            let own = Path::new(file);
            let stem = own
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            let referenced = |symbol: &str| {
                corpus.iter().any(|(path, content)| {
                    let mentions_stem = !stem.is_empty() && content.contains(stem);
                    path.as_path() != own && (content.contains(symbol) || mentions_stem)
                })
            };
            let unwired: Vec<&String> = symbols.iter().filter(|s| !referenced(s.as_str())).collect();
            if unwired.is_empty() {
                checks.push(check(
                    CheckCategory::Wiring,
                    file,
                    true,
                    &format!("{} exported symbol(s) referenced", symbols.len()),
                ));
            }
            for symbol in unwired {
                checks.push(check(
                    CheckCategory::Wiring,
                    file,
                    false,
                    &format!(
                        "exported symbol '{symbol}' is not referenced anywhere else in the project"
                    ),
                ));
            }
        }
        checks
    }

    /// Up to [`MAX_SCAN_FILES`] source files (repo-relative path, content),
    /// skipping dependency, build and VCS directories.
    fn scan_sources(&self) -> Vec<(PathBuf, String)> {
        let walker = WalkDir::new(&self.repo_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !SKIP_DIRS.iter().any(|skip| entry.file_name() == *skip)
            });

        let mut sources = Vec::new();
        for entry in walker.filter_map(Result::ok) {
            if sources.len() >= MAX_SCAN_FILES {
                debug!(limit = MAX_SCAN_FILES, "source scan limit reached");
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let is_source = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
            if !is_source {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.repo_root) else {
                continue;
            };
            match fs::read(entry.path()) {
                Ok(bytes) => sources.push((
                    relative.to_path_buf(),
                    String::from_utf8_lossy(&bytes).into_owned(),
                )),
                Err(err) => {
                    debug!(path = %entry.path().display(), err = %err, "unreadable source skipped");
                }
            }
        }
        sources
    }
}

/// `path` without `.` components, so `./pkg/x.go` and `pkg/x.go` name the
/// same file and match the repo-relative paths of the source scan.
fn normalize(path: &str) -> String {
    Path::new(path.trim())
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

fn check(category: CheckCategory, file: &str, passed: bool, detail: &str) -> VerifyCheck {
    VerifyCheck {
        category,
        file: file.to_string(),
        passed,
        detail: detail.to_string(),
    }
}
