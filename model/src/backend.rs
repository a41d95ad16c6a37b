use crate::types::{FormatSummary, TestReport, ValidationContext};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to launch test backend '{program}': {reason}")]
    Launch { program: String, reason: String },

    #[error("Test backend '{program}' exited with status {code:?} without a report: {stderr}")]
    NoReport {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Test backend report is not a key/value document")]
    MalformedReport,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Structural checks of a descriptor document.
///
/// Implementations must not perform I/O and must not fail: malformed input is
/// reported through a failing [`FormatSummary`].
pub trait FormatValidator: Send + Sync {
    fn validate_format(&self, descriptor: &Value, context: &ValidationContext) -> FormatSummary;

    fn validator_name(&self) -> &'static str;
}

/// Runs the full test suite of a staged model package.
///
/// Failures of the model itself belong in the returned report. `Err` is for
/// infrastructure problems only.
#[async_trait]
pub trait ModelTestBackend: Send + Sync {
    async fn test(&self, descriptor_path: &Path) -> BackendResult<TestReport>;

    fn backend_name(&self) -> &'static str;
}
