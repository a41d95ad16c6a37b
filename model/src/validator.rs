use crate::backend::FormatValidator;
use crate::rdf::RdfFormatValidator;
use crate::types::{ValidationContext, ValidationResult};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Answers `validate` calls. Stateless and safe to share across tasks.
#[derive(Clone)]
pub struct Validator {
    backend: Arc<dyn FormatValidator>,
}

impl Validator {
    pub fn new(backend: Arc<dyn FormatValidator>) -> Self {
        Self { backend }
    }

    /// Checks `descriptor` without any I/O. Never fails: a backend panic is
    /// reported as an unsuccessful result.
    pub fn validate(&self, descriptor: &Value) -> ValidationResult {
        let context = ValidationContext::format_only();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.backend.validate_format(descriptor, &context)
        }));

        match outcome {
            Ok(summary) => {
                debug!(
                    validator = self.backend.validator_name(),
                    status = %summary.status,
                    issues = summary.issues.len(),
                    "Descriptor validated"
                );
                ValidationResult::from(&summary)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    validator = self.backend.validator_name(),
                    "Format validator panicked: {}", reason
                );
                ValidationResult {
                    success: false,
                    details: format!("validator '{}' crashed: {}", self.backend.validator_name(), reason),
                }
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(RdfFormatValidator::new()))
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("backend", &self.backend.validator_name())
            .finish()
    }
}
