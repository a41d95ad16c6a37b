use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Outcome of a format check, as reported by a [`crate::FormatValidator`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormatStatus {
    Passed,
    Failed,
}

impl fmt::Display for FormatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatStatus::Passed => write!(f, "passed"),
            FormatStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Options handed to a format validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationContext {
    /// Whether the validator may touch the filesystem or network to check
    /// referenced files. The worker always passes `false`.
    pub perform_io_checks: bool,
}

impl ValidationContext {
    pub fn format_only() -> Self {
        Self {
            perform_io_checks: false,
        }
    }
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self::format_only()
    }
}

/// A single problem found in a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatIssue {
    /// Dotted location inside the descriptor, e.g. `inputs.0.id`.
    pub loc: String,
    pub msg: String,
}

impl FormatIssue {
    pub fn new(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            msg: msg.into(),
        }
    }
}

/// Summary produced by a format validation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatSummary {
    pub name: String,
    pub status: FormatStatus,
    pub issues: Vec<FormatIssue>,
}

impl FormatSummary {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: FormatStatus::Passed,
            issues: Vec::new(),
        }
    }

    pub fn from_issues(name: impl Into<String>, issues: Vec<FormatIssue>) -> Self {
        let status = if issues.is_empty() {
            FormatStatus::Passed
        } else {
            FormatStatus::Failed
        };
        Self {
            name: name.into(),
            status,
            issues,
        }
    }

    /// Human-readable report: a status header followed by one line per issue.
    pub fn format(&self) -> String {
        let mut out = format!("{} {}: {}", status_marker(self.status), self.name, self.status);
        for issue in &self.issues {
            out.push_str(&format!("\n  - {}: {}", issue.loc, issue.msg));
        }
        out
    }
}

fn status_marker(status: FormatStatus) -> &'static str {
    match status {
        FormatStatus::Passed => "[ok]",
        FormatStatus::Failed => "[x]",
    }
}

/// Answer to a `validate` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub success: bool,
    pub details: String,
}

impl From<&FormatSummary> for ValidationResult {
    fn from(summary: &FormatSummary) -> Self {
        Self {
            success: summary.status == FormatStatus::Passed,
            details: summary.format(),
        }
    }
}

/// Structured output of a model's test suite.
///
/// The payload is whatever the test backend produced; the worker only
/// requires it to be a key/value document. A report with a failing status is
/// still a successful call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TestReport(Map<String, Value>);

impl TestReport {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Builds a report from any JSON value; non-object values are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn passed(&self) -> bool {
        self.status() == Some("passed")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_status_follows_issues() {
        let summary = FormatSummary::from_issues("demo", vec![]);
        assert_eq!(summary.status, FormatStatus::Passed);

        let summary =
            FormatSummary::from_issues("demo", vec![FormatIssue::new("name", "field required")]);
        assert_eq!(summary.status, FormatStatus::Failed);
    }

    #[test]
    fn test_summary_format_lists_issues() {
        let summary = FormatSummary::from_issues(
            "demo",
            vec![
                FormatIssue::new("name", "field required"),
                FormatIssue::new("weights", "at least one weights entry is required"),
            ],
        );
        let text = summary.format();
        assert!(text.starts_with("[x] demo: failed"));
        assert!(text.contains("- name: field required"));
        assert!(text.contains("- weights: at least one weights entry is required"));
    }

    #[test]
    fn test_validation_result_from_summary() {
        let result = ValidationResult::from(&FormatSummary::passed("demo"));
        assert!(result.success);
        assert_eq!(result.details, "[ok] demo: passed");
    }

    #[test]
    fn test_report_status() {
        let report = TestReport::from_value(json!({"status": "passed", "details": []})).unwrap();
        assert_eq!(report.status(), Some("passed"));
        assert!(report.passed());

        let report = TestReport::from_value(json!({"status": "failed"})).unwrap();
        assert!(!report.passed());

        assert!(TestReport::from_value(json!([1, 2, 3])).is_none());
    }

    #[test]
    fn test_report_serializes_transparently() {
        let report = TestReport::from_value(json!({"status": "passed", "name": "demo"})).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, json!({"status": "passed", "name": "demo"}));
    }
}
