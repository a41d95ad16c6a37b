//! Built-in structural validator for model resource descriptors (`rdf.yaml`).
//!
//! Only the shape of the document is checked. Referenced files, URLs and
//! checksums are never touched, regardless of the validation context.

use crate::backend::FormatValidator;
use crate::types::{FormatIssue, FormatSummary, ValidationContext};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

pub const SUMMARY_NAME: &str = "bioimageio format validation";

/// Weight formats a model descriptor may declare.
pub const KNOWN_WEIGHT_FORMATS: &[&str] = &[
    "keras_hdf5",
    "onnx",
    "pytorch_state_dict",
    "tensorflow_js",
    "tensorflow_saved_model_bundle",
    "torchscript",
];

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("static pattern compiles"))
}

#[derive(Debug, Clone, Default)]
pub struct RdfFormatValidator;

impl RdfFormatValidator {
    pub fn new() -> Self {
        Self
    }

    fn check(descriptor: &Value) -> Vec<FormatIssue> {
        let mut issues = Vec::new();

        let Some(root) = descriptor.as_object() else {
            issues.push(FormatIssue::new("", "descriptor must be a mapping"));
            return issues;
        };

        match root.get("format_version") {
            Some(Value::String(version)) if version_pattern().is_match(version) => {}
            Some(Value::String(version)) => issues.push(FormatIssue::new(
                "format_version",
                format!("'{}' is not a MAJOR.MINOR.PATCH version", version),
            )),
            Some(_) => issues.push(FormatIssue::new("format_version", "expected a string")),
            None => issues.push(FormatIssue::new("format_version", "field required")),
        }

        require_non_empty_string(root, "name", &mut issues);

        match require_non_empty_string(root, "type", &mut issues) {
            Some("model") => Self::check_model(root, &mut issues),
            Some(other) => debug!("No type-specific checks for descriptor type '{}'", other),
            None => {}
        }

        issues
    }

    fn check_model(root: &Map<String, Value>, issues: &mut Vec<FormatIssue>) {
        check_tensors(root, "inputs", issues);
        check_tensors(root, "outputs", issues);

        match root.get("weights") {
            Some(Value::Object(weights)) if weights.is_empty() => issues.push(FormatIssue::new(
                "weights",
                "at least one weights entry is required",
            )),
            Some(Value::Object(weights)) => {
                for (format, entry) in weights {
                    let loc = format!("weights.{}", format);
                    if !KNOWN_WEIGHT_FORMATS.contains(&format.as_str()) {
                        issues.push(FormatIssue::new(&loc, "unknown weights format"));
                        continue;
                    }
                    match entry.as_object() {
                        Some(entry) => {
                            let source_ok = entry
                                .get("source")
                                .and_then(Value::as_str)
                                .is_some_and(|s| !s.trim().is_empty());
                            if !source_ok {
                                issues.push(FormatIssue::new(
                                    format!("{}.source", loc),
                                    "field required",
                                ));
                            }
                        }
                        None => issues.push(FormatIssue::new(loc, "expected a mapping")),
                    }
                }
            }
            Some(_) => issues.push(FormatIssue::new("weights", "expected a mapping")),
            None => issues.push(FormatIssue::new("weights", "field required")),
        }
    }
}

fn require_non_empty_string<'a>(
    root: &'a Map<String, Value>,
    key: &str,
    issues: &mut Vec<FormatIssue>,
) -> Option<&'a str> {
    match root.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
        Some(Value::String(_)) => {
            issues.push(FormatIssue::new(key, "must not be empty"));
            None
        }
        Some(_) => {
            issues.push(FormatIssue::new(key, "expected a string"));
            None
        }
        None => {
            issues.push(FormatIssue::new(key, "field required"));
            None
        }
    }
}

fn check_tensors(root: &Map<String, Value>, key: &str, issues: &mut Vec<FormatIssue>) {
    let tensors = match root.get(key) {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => {
            issues.push(FormatIssue::new(key, "at least one tensor is required"));
            return;
        }
        Some(_) => {
            issues.push(FormatIssue::new(key, "expected a list"));
            return;
        }
        None => {
            issues.push(FormatIssue::new(key, "field required"));
            return;
        }
    };

    let mut seen = HashSet::new();
    for (index, tensor) in tensors.iter().enumerate() {
        let loc = format!("{}.{}", key, index);
        let Some(tensor) = tensor.as_object() else {
            issues.push(FormatIssue::new(loc, "expected a mapping"));
            continue;
        };

        // 0.5 descriptors name tensors by `id`, 0.4 by `name`.
        let ident = ["id", "name"]
            .iter()
            .find_map(|field| tensor.get(*field).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty());

        match ident {
            Some(ident) if !seen.insert(ident.to_string()) => issues.push(FormatIssue::new(
                format!("{}.id", loc),
                format!("duplicate tensor id '{}'", ident),
            )),
            Some(_) => {}
            None => issues.push(FormatIssue::new(format!("{}.id", loc), "field required")),
        }
    }
}

impl FormatValidator for RdfFormatValidator {
    fn validate_format(&self, descriptor: &Value, context: &ValidationContext) -> FormatSummary {
        if context.perform_io_checks {
            debug!("I/O checks requested but not supported; validating format only");
        }
        FormatSummary::from_issues(SUMMARY_NAME, Self::check(descriptor))
    }

    fn validator_name(&self) -> &'static str {
        "rdf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FormatStatus;
    use serde_json::json;

    fn valid_model() -> Value {
        json!({
            "format_version": "0.5.3",
            "type": "model",
            "name": "demo",
            "inputs": [{"id": "raw"}],
            "outputs": [{"id": "mask"}],
            "weights": {
                "torchscript": {"source": "weights.pt"}
            }
        })
    }

    fn issues_for(descriptor: Value) -> Vec<FormatIssue> {
        RdfFormatValidator::new()
            .validate_format(&descriptor, &ValidationContext::format_only())
            .issues
    }

    #[test]
    fn test_valid_model_passes() {
        let summary = RdfFormatValidator::new()
            .validate_format(&valid_model(), &ValidationContext::format_only());
        assert_eq!(summary.status, FormatStatus::Passed);
        assert_eq!(summary.name, SUMMARY_NAME);
    }

    #[test]
    fn test_legacy_tensor_names_accepted() {
        let mut descriptor = valid_model();
        descriptor["format_version"] = json!("0.4.10");
        descriptor["inputs"] = json!([{"name": "input0"}]);
        descriptor["outputs"] = json!([{"name": "output0"}]);
        assert!(issues_for(descriptor).is_empty());
    }

    #[test]
    fn test_non_mapping_rejected() {
        let issues = issues_for(json!(["not", "a", "mapping"]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].msg, "descriptor must be a mapping");
    }

    #[test]
    fn test_missing_top_level_fields() {
        let issues = issues_for(json!({}));
        let locs: Vec<&str> = issues.iter().map(|i| i.loc.as_str()).collect();
        assert_eq!(locs, vec!["format_version", "name", "type"]);
    }

    #[test]
    fn test_bad_format_version() {
        let mut descriptor = valid_model();
        descriptor["format_version"] = json!("latest");
        let issues = issues_for(descriptor);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].loc, "format_version");

        let mut descriptor = valid_model();
        descriptor["format_version"] = json!(5);
        assert_eq!(issues_for(descriptor)[0].msg, "expected a string");
    }

    #[test]
    fn test_model_tensor_checks() {
        let mut descriptor = valid_model();
        descriptor["inputs"] = json!([]);
        descriptor["outputs"] = json!([{"id": "a"}, {"id": "a"}, {"axes": []}, 3]);
        let issues = issues_for(descriptor);
        let locs: Vec<&str> = issues.iter().map(|i| i.loc.as_str()).collect();
        assert_eq!(locs, vec!["inputs", "outputs.1.id", "outputs.2.id", "outputs.3"]);
        assert!(issues[1].msg.contains("duplicate"));
    }

    #[test]
    fn test_model_weights_checks() {
        let mut descriptor = valid_model();
        descriptor["weights"] = json!({});
        assert_eq!(issues_for(descriptor)[0].loc, "weights");

        let mut descriptor = valid_model();
        descriptor["weights"] = json!({
            "onnx": {"source": ""},
            "caffe": {"source": "x"},
            "torchscript": "weights.pt"
        });
        let issues = issues_for(descriptor);
        let locs: Vec<&str> = issues.iter().map(|i| i.loc.as_str()).collect();
        assert!(locs.contains(&"weights.onnx.source"));
        assert!(locs.contains(&"weights.caffe"));
        assert!(locs.contains(&"weights.torchscript"));

        let mut descriptor = valid_model();
        descriptor.as_object_mut().unwrap().remove("weights");
        assert_eq!(issues_for(descriptor)[0].msg, "field required");
    }

    #[test]
    fn test_non_model_types_skip_model_checks() {
        let descriptor = json!({
            "format_version": "0.3.0",
            "type": "dataset",
            "name": "cells"
        });
        assert!(issues_for(descriptor).is_empty());
    }

    #[test]
    fn test_io_checks_flag_is_ignored() {
        let summary = RdfFormatValidator::new().validate_format(
            &valid_model(),
            &ValidationContext {
                perform_io_checks: true,
            },
        );
        assert_eq!(summary.status, FormatStatus::Passed);
    }
}
