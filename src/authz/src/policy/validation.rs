//! Policy source validation and content checksums
//!
//! Validation is structural: package declaration, balanced delimiters,
//! rule presence, and a scan for constructs that would make evaluation
//! non-deterministic or reach outside the engine. Invalid content is a
//! structured outcome, not an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single problem found in policy source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// 1-indexed source line, absent for whole-document issues
    pub line: Option<usize>,
    pub message: String,
}

impl ValidationIssue {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    fn global(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

/// Result of validating one policy source document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Declared package name, when one parsed
    pub package: Option<String>,
    pub errors: Vec<ValidationIssue>,
}

/// Lowercase SHA-256 hex digest of policy content
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Structural validator for Rego-style policy source
pub struct PolicyValidator {
    package_re: Regex,
    rule_re: Regex,
    forbidden: Vec<(Regex, &'static str)>,
}

impl PolicyValidator {
    pub fn new() -> Self {
        // Literal patterns, compiled once per validator
        let package_re = Regex::new(r"^package\s+([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)*)\s*$")
            .expect("package pattern compiles");
        let rule_re = Regex::new(
            r"^\s*(?:default\s+)?[a-z_][A-Za-z0-9_]*(?:\([^)]*\))?(?:\[[^\]]*\])?\s*(?::?=|\{|if\b)",
        )
        .expect("rule pattern compiles");
        let forbidden = vec![
            (
                Regex::new(r"http\.send").expect("forbidden pattern compiles"),
                "http.send is not allowed: policies may not make outbound HTTP calls",
            ),
            (
                Regex::new(r"\bnet\.[a-z_]+").expect("forbidden pattern compiles"),
                "net.* builtins are not allowed: policies may not touch the network",
            ),
            (
                Regex::new(r"time\.now_ns").expect("forbidden pattern compiles"),
                "time.now_ns is not allowed: read input.context.timestamp instead",
            ),
            (
                Regex::new(r"opa\.runtime").expect("forbidden pattern compiles"),
                "opa.runtime is not allowed: policies may not inspect the runtime environment",
            ),
        ];

        Self {
            package_re,
            rule_re,
            forbidden,
        }
    }

    /// Validate one policy source document
    pub fn validate(&self, source: &str) -> ValidationOutcome {
        let mut errors = Vec::new();

        if source.trim().is_empty() {
            errors.push(ValidationIssue::global("policy source is empty"));
            return ValidationOutcome {
                valid: false,
                package: None,
                errors,
            };
        }

        // String contents and comments are blanked out first so that braces
        // and builtin names inside them are never counted.
        let stripped = strip_strings_and_comments(source);

        let package = self.check_package(&stripped, &mut errors);
        self.check_delimiters(&stripped, &mut errors);
        self.check_rules(&stripped, &mut errors);
        self.check_forbidden(&stripped, &mut errors);

        ValidationOutcome {
            valid: errors.is_empty(),
            package,
            errors,
        }
    }

    fn check_package(
        &self,
        lines: &[String],
        errors: &mut Vec<ValidationIssue>,
    ) -> Option<String> {
        for (idx, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("package") {
                return match self.package_re.captures(trimmed) {
                    Some(caps) => caps.get(1).map(|m| m.as_str().to_string()),
                    None => {
                        errors.push(ValidationIssue::at(
                            idx + 1,
                            "malformed package declaration: expected 'package name.segment'",
                        ));
                        None
                    }
                };
            }
        }
        errors.push(ValidationIssue::global("missing package declaration"));
        None
    }

    fn check_delimiters(&self, lines: &[String], errors: &mut Vec<ValidationIssue>) {
        let mut stack: Vec<(char, usize)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            for c in line.chars() {
                match c {
                    '(' | '[' | '{' => stack.push((c, idx + 1)),
                    ')' | ']' | '}' => match stack.pop() {
                        Some((open, _)) if open == opener_for(c) => {}
                        Some((open, open_line)) => {
                            errors.push(ValidationIssue::at(
                                idx + 1,
                                format!(
                                    "mismatched '{}': '{}' from line {} is still open",
                                    c, open, open_line
                                ),
                            ));
                        }
                        None => {
                            errors.push(ValidationIssue::at(idx + 1, format!("unmatched '{}'", c)));
                        }
                    },
                    _ => {}
                }
            }
        }
        for (open, line) in stack {
            errors.push(ValidationIssue::at(line, format!("unclosed '{}'", open)));
        }
    }

    fn check_rules(&self, lines: &[String], errors: &mut Vec<ValidationIssue>) {
        let has_rule = lines.iter().any(|line| {
            let trimmed = line.trim();
            !trimmed.starts_with("package")
                && !trimmed.starts_with("import")
                && self.rule_re.is_match(line)
        });
        if !has_rule {
            errors.push(ValidationIssue::global("policy defines no rules"));
        }
    }

    fn check_forbidden(&self, lines: &[String], errors: &mut Vec<ValidationIssue>) {
        for (idx, line) in lines.iter().enumerate() {
            for (pattern, message) in &self.forbidden {
                if pattern.is_match(line) {
                    errors.push(ValidationIssue::at(idx + 1, *message));
                }
            }
        }
    }
}

impl Default for PolicyValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn opener_for(closer: char) -> char {
    match closer {
        ')' => '(',
        ']' => '[',
        _ => '{',
    }
}

/// Replace string contents and comments with spaces, preserving line
/// structure. Double-quoted strings honor backslash escapes; backtick raw
/// strings may span lines.
fn strip_strings_and_comments(source: &str) -> Vec<String> {
    enum State {
        Normal,
        Comment,
        Str,
        Raw,
    }

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            lines.push(std::mem::take(&mut current));
            match state {
                // Comments and quoted strings do not span lines
                State::Comment | State::Str => state = State::Normal,
                _ => {}
            }
            continue;
        }
        match state {
            State::Normal => match c {
                '#' => {
                    state = State::Comment;
                    current.push(' ');
                }
                '"' => {
                    state = State::Str;
                    current.push('"');
                }
                '`' => {
                    state = State::Raw;
                    current.push('`');
                }
                _ => current.push(c),
            },
            State::Comment => current.push(' '),
            State::Str => match c {
                '\\' => {
                    current.push(' ');
                    if chars.peek().is_some_and(|&next| next != '\n') {
                        chars.next();
                        current.push(' ');
                    }
                }
                '"' => {
                    state = State::Normal;
                    current.push('"');
                }
                _ => current.push(' '),
            },
            State::Raw => match c {
                '`' => {
                    state = State::Normal;
                    current.push('`');
                }
                _ => current.push(' '),
            },
        }
    }
    lines.push(current);
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_POLICY: &str = r#"package verdict.authz

import input.principal

default allow = false

allow {
    input.principal.type == "user"
    input.action == "read"
}
"#;

    fn validator() -> PolicyValidator {
        PolicyValidator::new()
    }

    #[test]
    fn test_valid_policy_passes() {
        let outcome = validator().validate(VALID_POLICY);
        assert!(outcome.valid, "unexpected errors: {:?}", outcome.errors);
        assert_eq!(outcome.package.as_deref(), Some("verdict.authz"));
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_empty_source_is_invalid() {
        let outcome = validator().validate("   \n  ");
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("empty"));
    }

    #[test]
    fn test_missing_package() {
        let outcome = validator().validate("allow = true\n");
        assert!(!outcome.valid);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.message.contains("missing package")));
    }

    #[test]
    fn test_malformed_package() {
        let outcome = validator().validate("package 9bad.Name\n\nallow = true\n");
        assert!(!outcome.valid);
        let issue = outcome
            .errors
            .iter()
            .find(|e| e.message.contains("malformed package"))
            .unwrap();
        assert_eq!(issue.line, Some(1));
    }

    #[test]
    fn test_unclosed_brace_reports_opening_line() {
        let source = "package p\n\nallow {\n    input.x == 1\n";
        let outcome = validator().validate(source);
        assert!(!outcome.valid);
        let issue = outcome
            .errors
            .iter()
            .find(|e| e.message.contains("unclosed '{'"))
            .unwrap();
        assert_eq!(issue.line, Some(3));
    }

    #[test]
    fn test_mismatched_and_unmatched_closers() {
        let outcome = validator().validate("package p\n\nallow {\n    x := (1]\n}\n");
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.message.contains("mismatched ']'")));

        let outcome = validator().validate("package p\n\nallow = true\n}\n");
        let issue = outcome
            .errors
            .iter()
            .find(|e| e.message.contains("unmatched '}'"))
            .unwrap();
        assert_eq!(issue.line, Some(4));
    }

    #[test]
    fn test_policy_without_rules() {
        let outcome = validator().validate("package p\n\nimport input.principal\n");
        assert!(!outcome.valid);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.message.contains("no rules")));
    }

    #[test]
    fn test_forbidden_constructs_flagged_with_lines() {
        let source = "package p\n\nallow {\n    resp := http.send({\"url\": u})\n    ip := net.lookup_ip_addr(\"example.com\")\n    now := time.now_ns()\n    env := opa.runtime()\n}\n";
        let outcome = validator().validate(source);
        assert!(!outcome.valid);

        let lines: Vec<Option<usize>> = outcome.errors.iter().map(|e| e.line).collect();
        assert!(lines.contains(&Some(4)));
        assert!(lines.contains(&Some(5)));
        assert!(lines.contains(&Some(6)));
        assert!(lines.contains(&Some(7)));

        let timestamp_hint = outcome
            .errors
            .iter()
            .find(|e| e.message.contains("time.now_ns"))
            .unwrap();
        assert!(timestamp_hint.message.contains("input.context.timestamp"));
    }

    #[test]
    fn test_word_boundary_on_net_builtins() {
        let source = "package p\n\nallow {\n    input.resource.subnet.contains == true\n}\n";
        let outcome = validator().validate(source);
        assert!(outcome.valid, "unexpected errors: {:?}", outcome.errors);
    }

    #[test]
    fn test_strings_and_comments_are_inert() {
        let source = "package p\n\n# braces { [ ( and http.send in a comment\nallow {\n    msg := \"mentions http.send and time.now_ns {\"\n    input.action == \"read\"\n}\n";
        let outcome = validator().validate(source);
        assert!(outcome.valid, "unexpected errors: {:?}", outcome.errors);
    }

    #[test]
    fn test_raw_string_spans_lines() {
        let source = "package p\n\nallow {\n    doc := `first {\nsecond }`\n    input.x == 1\n}\n";
        let outcome = validator().validate(source);
        assert!(outcome.valid, "unexpected errors: {:?}", outcome.errors);
    }

    #[test]
    fn test_checksum_format_and_stability() {
        let digest = checksum("package p\n\nallow = true\n");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(digest, checksum("package p\n\nallow = true\n"));
        assert_ne!(digest, checksum("package p\n\nallow = false\n"));
    }

    #[test]
    fn test_checksum_known_vector() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
