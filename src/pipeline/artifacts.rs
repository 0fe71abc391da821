//! Artifact extraction from assistant answers
//!
//! Runs after persistence and never affects what was streamed. Fixed-type
//! fences (html, svg, mermaid, json) are matched first, then `executable:`
//! blocks, then generic `artifact:` blocks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const FIXED_TYPES: [&str; 4] = ["html", "svg", "mermaid", "json"];

const EXECUTABLE_LANGUAGES: [&str; 6] = ["javascript", "js", "typescript", "ts", "python", "py"];

const EXECUTABLE_PATTERNS: &[&str] = &[
    "console.log",
    "console.error",
    "console.warn",
    "function",
    "const ",
    "let ",
    "var ",
    "=>",
    "if (",
    "for (",
    "while (",
    "return ",
    "print(",
    "import ",
    "from ",
    "def ",
    "if __name__",
    "class ",
    "for ",
    "while ",
];

static FIXED_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    FIXED_TYPES
        .iter()
        .map(|kind| {
            let pattern = format!(r"(?s)```{kind}\s*<!--\s*artifact:\s*([^>]+?)\s*-->\s*\n(.*?)\n```");
            (*kind, Regex::new(&pattern).expect("static artifact pattern"))
        })
        .collect()
});

static EXECUTABLE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(\w+)?\s*<!--\s*executable:\s*([^>]+?)\s*-->\s*\n(.*?)\n```")
        .expect("static executable pattern")
});

static GENERIC_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(\w+)?\s*<!--\s*artifact:\s*([^>]+?)\s*-->\s*\n(.*?)\n```")
        .expect("static artifact pattern")
});

/// One extracted artifact, stored as JSON on the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    pub language: String,
}

impl Artifact {
    fn new(kind: &str, title: &str, content: &str, language: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            title: title.trim().to_string(),
            content: content.trim().to_string(),
            language: language.to_string(),
        }
    }
}

pub fn is_executable_language(language: &str) -> bool {
    EXECUTABLE_LANGUAGES.contains(&language.trim().to_ascii_lowercase().as_str())
}

fn has_executable_patterns(content: &str) -> bool {
    let lowered = content.to_lowercase();
    EXECUTABLE_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Extract every artifact in `content`, in pattern order
pub fn extract_artifacts(content: &str) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    for (kind, regex) in FIXED_PATTERNS.iter() {
        for caps in regex.captures_iter(content) {
            artifacts.push(Artifact::new(kind, &caps[1], &caps[2], kind));
        }
    }

    for caps in EXECUTABLE_BLOCK.captures_iter(content) {
        let language = caps.get(1).map_or("", |m| m.as_str());
        if FIXED_TYPES.contains(&language) {
            continue;
        }
        let language = if language.is_empty() { "javascript" } else { language };
        if is_executable_language(language) {
            artifacts.push(Artifact::new("executable-code", &caps[2], &caps[3], language));
        }
    }

    for caps in GENERIC_BLOCK.captures_iter(content) {
        let language = caps.get(1).map_or("", |m| m.as_str());
        if FIXED_TYPES.contains(&language) {
            continue;
        }
        let language = if language.is_empty() { "text" } else { language };
        let body = &caps[3];
        let kind = if is_executable_language(language) && has_executable_patterns(body.trim()) {
            "executable-code"
        } else {
            "code"
        };
        artifacts.push(Artifact::new(kind, &caps[2], body, language));
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_types_come_first() {
        let content = "intro\n```python <!-- artifact: Script -->\nprint(1)\n```\n\n```html <!-- artifact: Page -->\n<p>hi</p>\n```\n";
        let artifacts = extract_artifacts(content);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].kind, "html");
        assert_eq!(artifacts[0].title, "Page");
        assert_eq!(artifacts[0].content, "<p>hi</p>");
        assert_eq!(artifacts[1].kind, "executable-code");
        assert_eq!(artifacts[1].language, "python");
    }

    #[test]
    fn test_executable_marker() {
        let content = "```ts <!-- executable: Adder -->\nconst a = 1 + 2;\n```";
        let artifacts = extract_artifacts(content);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, "executable-code");
        assert_eq!(artifacts[0].language, "ts");
        assert_eq!(artifacts[0].title, "Adder");
    }

    #[test]
    fn test_executable_marker_requires_supported_language() {
        let content = "```rust <!-- executable: Main -->\nfn main() {}\n```";
        assert!(extract_artifacts(content).is_empty());
    }

    #[test]
    fn test_generic_code_without_patterns() {
        let content = "```toml <!-- artifact: Config -->\n[server]\nport = 1\n```";
        let artifacts = extract_artifacts(content);
        assert_eq!(artifacts[0].kind, "code");
        assert_eq!(artifacts[0].language, "toml");

        let plain = "```python <!-- artifact: Data -->\n[1, 2]\n```";
        assert_eq!(extract_artifacts(plain)[0].kind, "code");
    }

    #[test]
    fn test_serialized_shape() {
        let content = "```svg <!-- artifact: Logo -->\n<svg/>\n```";
        let json = serde_json::to_value(extract_artifacts(content)).unwrap();
        assert_eq!(json[0]["type"], "svg");
        assert_eq!(json[0]["language"], "svg");
        assert!(json[0]["uuid"].as_str().unwrap().len() >= 32);
    }

    #[test]
    fn test_plain_answer_has_no_artifacts() {
        assert!(extract_artifacts("Hi there!").is_empty());
    }
}
