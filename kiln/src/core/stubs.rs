//! Placeholder and triviality detection over source text.

use std::sync::LazyLock;

use regex::Regex;

/// Longest source excerpt kept in a stub report.
const MAX_EXCERPT_CHARS: usize = 120;

static STUB_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(TODO|FIXME|PLACEHOLDER|HACK)\b",
        r"(?i)(not\s+implemented|coming\s+soon|lorem\s+ipsum)",
        r"(?i)return\s+(null|nil|None)\s*;?\s*$",
        r"(?i)return\s+(\{\}|\[\])\s*;?\s*$",
        r"(?i)^\s*pass\s*$",
        r#"(?i)panic\(\s*"(not implemented|todo|unimplemented)"#,
        r#"(?i)throw\s+new\s+Error\(\s*["'](not implemented|todo)"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

const COMMENT_PREFIXES: [&str; 6] = ["//", "#", "/*", "*", "'''", "\"\"\""];

/// A line that looks like placeholder code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubHit {
    /// 1-based line number.
    pub line: usize,
    /// Trimmed source line, capped at 120 characters.
    pub excerpt: String,
}

impl StubHit {
    pub fn describe(&self) -> String {
        format!("L{}: {}", self.line, self.excerpt)
    }
}

/// Scan `content` line by line; the first matching pattern per line wins.
pub fn find_stubs(content: &str) -> Vec<StubHit> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| STUB_PATTERNS.iter().any(|re| re.is_match(line)))
        .map(|(idx, line)| StubHit {
            line: idx + 1,
            excerpt: excerpt(line.trim()),
        })
        .collect()
}

fn excerpt(line: &str) -> String {
    if line.chars().count() <= MAX_EXCERPT_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(MAX_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Lines that are neither blank nor full-line comments.
pub fn substantive_lines(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !COMMENT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)))
        .count()
}

/// Describe why a file is trivial, or `None` when it has real content.
pub fn triviality(content: &str) -> Option<String> {
    if content.is_empty() {
        return Some("file is empty (0 bytes)".to_string());
    }
    let count = substantive_lines(content);
    (count <= 1).then(|| format!("file has only {count} substantive line(s)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_return_nil_body_is_flagged() {
        let source = "package api\n\nfunc Handle() error {\n\treturn nil\n}\n";
        let hits = find_stubs(source);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].describe(), "L4: return nil");
    }

    #[test]
    fn real_return_is_not_flagged() {
        let source = "package calc\n\nfunc Add(a, b int) int { return a + b }\n";
        assert!(find_stubs(source).is_empty());
    }

    #[test]
    fn markers_and_placeholder_bodies_are_flagged() {
        let source = [
            "// TODO: wire this up",
            "def run():",
            "    pass",
            "throw new Error('not implemented yet')",
            "panic(\"todo\")",
            "return [];",
            "const token = todoList.length;",
        ]
        .join("\n");
        let lines: Vec<usize> = find_stubs(&source).iter().map(|hit| hit.line).collect();
        assert_eq!(lines, vec![1, 3, 4, 5, 6]);
    }

    #[test]
    fn long_lines_are_truncated() {
        let line = format!("// TODO {}", "x".repeat(200));
        let hits = find_stubs(&line);
        assert_eq!(hits[0].excerpt.chars().count(), MAX_EXCERPT_CHARS + 3);
        assert!(hits[0].excerpt.ends_with("..."));
    }

    #[test]
    fn empty_file_is_trivial() {
        assert_eq!(triviality("").as_deref(), Some("file is empty (0 bytes)"));
    }

    #[test]
    fn comment_only_file_is_trivial() {
        let source = "// header\n# note\n/* block\n * more\n */\n\nexport const x = 1;\n";
        assert_eq!(
            triviality(source).as_deref(),
            Some("file has only 1 substantive line(s)")
        );
    }

    #[test]
    fn file_with_body_is_not_trivial() {
        assert!(triviality("fn main() {\n    run();\n}\n").is_none());
    }
}
