//! Submission content validation and sanitization.
//!
//! The HTTP boundary is the only place user text enters the system; it is
//! length-checked, matched against an allowlist, screened for known attack
//! patterns, and HTML-escaped before a task record exists.

use crate::MaestroError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

/// Upper bound on submission text.
pub const MAX_INPUT_LENGTH: usize = 10_000;

// Allowlist covering natural-language requests including code snippets.
static SAFE_INPUT_REGEX: &str = r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\x22\n\r\t]+$";

// Known injection and traversal shapes rejected outright.
static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    ";rm",
    "`rm",
    "$(rm",
    "union select",
    "drop table",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
];

#[derive(Debug, Clone)]
pub struct SubmissionValidator {
    safe_input_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl SubmissionValidator {
    pub fn new() -> Result<Self, MaestroError> {
        let safe_input_regex = Regex::new(SAFE_INPUT_REGEX)
            .map_err(|e| MaestroError::Configuration(format!("invalid validator regex: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        Ok(Self {
            safe_input_regex,
            dangerous_patterns,
        })
    }

    /// Validates a submission's input text and returns the sanitized form.
    pub fn validate_input(&self, input: &str) -> Result<String, MaestroError> {
        if input.trim().is_empty() {
            return Err(MaestroError::Validation("input cannot be empty".into()));
        }
        if input.len() > MAX_INPUT_LENGTH {
            return Err(MaestroError::Validation(format!(
                "input exceeds maximum length of {MAX_INPUT_LENGTH} characters"
            )));
        }
        let lower = input.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lower.contains(pattern) {
                return Err(MaestroError::Validation(
                    "input contains a disallowed pattern".into(),
                ));
            }
        }
        if !self.safe_input_regex.is_match(input) {
            return Err(MaestroError::Validation(
                "input contains unsupported characters".into(),
            ));
        }
        Ok(encode_text(input).to_string())
    }

    /// Task ids are caller-suppliable on retry; keep them URL-safe.
    pub fn validate_task_id(&self, task_id: &str) -> Result<(), MaestroError> {
        if task_id.is_empty() || task_id.len() > 128 {
            return Err(MaestroError::Validation(
                "task id must be 1..=128 characters".into(),
            ));
        }
        if !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MaestroError::Validation(
                "task id may only contain alphanumerics, '-' and '_'".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SubmissionValidator {
    fn default() -> Self {
        Self::new().expect("static validator regex must compile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_requests() {
        let v = SubmissionValidator::new().unwrap();
        assert!(v.validate_input("Summarize the quarterly report, please.").is_ok());
        assert!(v.validate_input("write fn main() { println!(\"hi\") }").is_ok());
    }

    #[test]
    fn rejects_empty_and_oversized() {
        let v = SubmissionValidator::new().unwrap();
        assert!(v.validate_input("   ").is_err());
        assert!(v.validate_input(&"a".repeat(MAX_INPUT_LENGTH + 1)).is_err());
    }

    #[test]
    fn rejects_dangerous_patterns() {
        let v = SubmissionValidator::new().unwrap();
        assert!(v.validate_input("<script>alert(1)</script>").is_err());
        assert!(v.validate_input("cat ../../etc/passwd").is_err());
        assert!(v.validate_input("'; drop table tasks").is_err());
    }

    #[test]
    fn escapes_html_in_sanitized_output() {
        let v = SubmissionValidator::new().unwrap();
        let out = v.validate_input("compare a < b").unwrap();
        assert!(out.contains("&lt;"));
    }

    #[test]
    fn task_id_rules() {
        let v = SubmissionValidator::new().unwrap();
        assert!(v.validate_task_id("task-42_ok").is_ok());
        assert!(v.validate_task_id("").is_err());
        assert!(v.validate_task_id("has space").is_err());
        assert!(v.validate_task_id("slash/id").is_err());
    }
}
