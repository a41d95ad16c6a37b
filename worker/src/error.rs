use model::RunnerError;
use package::{FetchError, ResolveError, StagingError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed `test_model` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    DownloadError,
    PackageFormatError,
    ResolutionError,
    StagingError,
    TestExecutionError,
    OverloadError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::DownloadError => "download_error",
            ErrorKind::PackageFormatError => "package_format_error",
            ErrorKind::ResolutionError => "resolution_error",
            ErrorKind::StagingError => "staging_error",
            ErrorKind::TestExecutionError => "test_execution_error",
            ErrorKind::OverloadError => "overload_error",
        };
        write!(f, "{}", name)
    }
}

/// Every way a test request can fail.
///
/// A model whose tests fail is not an error: that outcome is a
/// [`model::TestReport`] with a failing status.
#[derive(Error, Debug)]
pub enum TestError {
    /// The request was malformed and never admitted
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Non-2xx response or network failure while downloading
    #[error("Failed to download model from {url}: {reason}")]
    Download {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// The downloaded archive could not be extracted
    #[error("Invalid model package: {reason}")]
    PackageFormat { reason: String },

    /// The packaging backend could not materialise the model
    #[error("Could not resolve model '{model_id}': {reason}")]
    Resolution { model_id: String, reason: String },

    /// The staged package is missing or incomplete
    #[error("Staging failed: {reason}")]
    Staging { reason: String },

    /// The test backend could not be run
    #[error("Test execution failed: {reason}")]
    TestExecution { reason: String },

    /// The waiting queue is full
    #[error("Worker is at capacity: {capacity} requests already waiting")]
    Overload { capacity: usize },
}

impl TestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TestError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            TestError::Download { .. } => ErrorKind::DownloadError,
            TestError::PackageFormat { .. } => ErrorKind::PackageFormatError,
            TestError::Resolution { .. } => ErrorKind::ResolutionError,
            TestError::Staging { .. } => ErrorKind::StagingError,
            TestError::TestExecution { .. } => ErrorKind::TestExecutionError,
            TestError::Overload { .. } => ErrorKind::OverloadError,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<FetchError> for TestError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Download {
                url,
                status,
                reason,
            } => TestError::Download {
                url,
                status,
                reason,
            },
            FetchError::PackageFormat { .. } => TestError::PackageFormat {
                reason: error.to_string(),
            },
            FetchError::InvalidConfig { .. } | FetchError::Io { .. } | FetchError::Cancelled => {
                TestError::Staging {
                    reason: error.to_string(),
                }
            }
        }
    }
}

impl From<ResolveError> for TestError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Resolution { model_id, reason } => {
                TestError::Resolution { model_id, reason }
            }
            ResolveError::Cancelled { .. } => TestError::Staging {
                reason: error.to_string(),
            },
        }
    }
}

impl From<StagingError> for TestError {
    fn from(error: StagingError) -> Self {
        TestError::Staging {
            reason: error.to_string(),
        }
    }
}

impl From<RunnerError> for TestError {
    fn from(error: RunnerError) -> Self {
        match error {
            RunnerError::DescriptorMissing { .. } | RunnerError::DescriptorUnreadable { .. } => {
                TestError::Staging {
                    reason: error.to_string(),
                }
            }
            RunnerError::Execution(inner) => TestError::TestExecution {
                reason: inner.to_string(),
            },
        }
    }
}

/// Wire form of a [`TestError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}
