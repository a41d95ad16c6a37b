use crate::backend::{BackendError, ModelTestBackend};
use crate::types::TestReport;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    /// Nothing at the descriptor path
    #[error("Descriptor '{path}' does not exist")]
    DescriptorMissing { path: PathBuf },

    /// Something is at the path but it cannot be used as a descriptor
    #[error("Descriptor '{path}' is unreadable: {reason}")]
    DescriptorUnreadable { path: PathBuf, reason: String },

    /// The test backend could not produce a report
    #[error("Test backend failed: {0}")]
    Execution(#[from] BackendError),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Runs a model's test suite through a [`ModelTestBackend`].
#[derive(Clone)]
pub struct TestRunner {
    backend: Arc<dyn ModelTestBackend>,
}

impl TestRunner {
    pub fn new(backend: Arc<dyn ModelTestBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub async fn run(&self, descriptor_path: &Path) -> RunnerResult<TestReport> {
        match tokio::fs::metadata(descriptor_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(RunnerError::DescriptorUnreadable {
                    path: descriptor_path.to_path_buf(),
                    reason: "not a regular file".to_string(),
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RunnerError::DescriptorMissing {
                    path: descriptor_path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(RunnerError::DescriptorUnreadable {
                    path: descriptor_path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }

        let started = Instant::now();
        let report = self.backend.test(descriptor_path).await.inspect_err(|e| {
            warn!(backend = self.backend.backend_name(), "Test backend failed: {}", e);
        })?;

        info!(
            backend = self.backend.backend_name(),
            status = report.status().unwrap_or("unknown"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Test suite finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunner")
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedBackend {
        status: &'static str,
    }

    #[async_trait]
    impl ModelTestBackend for FixedBackend {
        async fn test(&self, _descriptor_path: &Path) -> BackendResult<TestReport> {
            TestReport::from_value(json!({"status": self.status})).ok_or(BackendError::MalformedReport)
        }

        fn backend_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl ModelTestBackend for BrokenBackend {
        async fn test(&self, _descriptor_path: &Path) -> BackendResult<TestReport> {
            Err(BackendError::Launch {
                program: "bioimageio".to_string(),
                reason: "No such file or directory".to_string(),
            })
        }

        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_run_returns_report() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("rdf.yaml");
        std::fs::write(&descriptor, "type: model\n").unwrap();

        let runner = TestRunner::new(Arc::new(FixedBackend { status: "passed" }));
        let report = runner.run(&descriptor).await.unwrap();
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_failing_report_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("rdf.yaml");
        std::fs::write(&descriptor, "type: model\n").unwrap();

        let runner = TestRunner::new(Arc::new(FixedBackend { status: "failed" }));
        let report = runner.run(&descriptor).await.unwrap();
        assert_eq!(report.status(), Some("failed"));
    }

    #[tokio::test]
    async fn test_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(Arc::new(FixedBackend { status: "passed" }));
        let result = runner.run(&dir.path().join("rdf.yaml")).await;
        assert!(matches!(result, Err(RunnerError::DescriptorMissing { .. })));
    }

    #[tokio::test]
    async fn test_directory_descriptor_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(Arc::new(FixedBackend { status: "passed" }));
        let result = runner.run(dir.path()).await;
        assert!(matches!(result, Err(RunnerError::DescriptorUnreadable { .. })));
    }

    #[tokio::test]
    async fn test_backend_failure_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("rdf.yaml");
        std::fs::write(&descriptor, "type: model\n").unwrap();

        let runner = TestRunner::new(Arc::new(BrokenBackend));
        let result = runner.run(&descriptor).await;
        assert!(matches!(result, Err(RunnerError::Execution(BackendError::Launch { .. }))));
    }
}
