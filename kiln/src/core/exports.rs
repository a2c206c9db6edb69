//! Language-specific exported symbol extraction for the wiring check.

use std::sync::LazyLock;

use regex::Regex;

static GO_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:func|type|var)\s+([A-Z]\w*)").unwrap());

static JS_EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"export\s+(?:default\s+)?(?:function|class|const|let|var|interface|type|enum)\s+(\w+)",
    )
    .unwrap()
});

static PY_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:def|class)\s+([A-Za-z_]\w*)").unwrap());

/// Languages whose exports the wiring check understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Go,
    JavaScript,
    Python,
}

impl Language {
    /// Pick a language from a file extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "go" => Some(Language::Go),
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "py" => Some(Language::Python),
            _ => None,
        }
    }
}

/// Exported symbol names in declaration order, deduplicated.
pub fn exported_symbols(language: Language, content: &str) -> Vec<String> {
    let re = match language {
        Language::Go => &*GO_EXPORT_RE,
        Language::JavaScript => &*JS_EXPORT_RE,
        Language::Python => &*PY_EXPORT_RE,
    };
    let mut symbols: Vec<String> = Vec::new();
    for caps in re.captures_iter(content) {
        let name = &caps[1];
        if language == Language::Python && name.starts_with('_') {
            continue;
        }
        if !symbols.iter().any(|existing| existing == name) {
            symbols.push(name.to_string());
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_exports_are_capitalised_declarations() {
        let source = "package api\n\nfunc HandleRequest() {}\nfunc helper() {}\ntype Server struct{}\nvar Default = 1\nvar internal = 2\n";
        assert_eq!(
            exported_symbols(Language::Go, source),
            vec!["HandleRequest", "Server", "Default"]
        );
    }

    #[test]
    fn js_exports_cover_declaration_kinds() {
        let source = "export default function App() {}\nexport const api = {};\nexport interface Props {}\nconst hidden = 1;\n";
        assert_eq!(
            exported_symbols(Language::JavaScript, source),
            vec!["App", "api", "Props"]
        );
    }

    #[test]
    fn python_exports_skip_private_and_nested_names() {
        let source = "def greet(name):\n    def inner():\n        pass\n    return name\n\nclass Greeter:\n    pass\n\ndef _private():\n    return 1\n";
        assert_eq!(
            exported_symbols(Language::Python, source),
            vec!["greet", "Greeter"]
        );
    }

    #[test]
    fn unknown_extensions_have_no_language() {
        assert_eq!(Language::from_extension("rs"), None);
        assert_eq!(Language::from_extension("tsx"), Some(Language::JavaScript));
    }
}
