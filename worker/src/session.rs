//! Lifecycle of a single test request.
//!
//! ```text
//! Idle -> Staging -> Testing -> Cleaning -> Done(report) | Done(error)
//! ```
//!
//! Cleaning always runs once a staging directory has been claimed. A session
//! stops early when its [`CancellationToken`] fires: staging copies check the
//! token between entries and the test run is abandoned, then cleanup runs as
//! usual. [`crate::WorkerGate`] runs sessions on their own task so a caller
//! going away cancels the session instead of dropping it mid-copy.

use crate::error::TestError;
use crate::request::{PackageSource, TestRequest};
use model::{TestReport, TestRunner};
use package::{PackageFetcher, PackageResolver, StagedPackage, StagingDir};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Staging,
    Testing,
    Cleaning,
    Done,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::Staging => write!(f, "staging"),
            SessionPhase::Testing => write!(f, "testing"),
            SessionPhase::Cleaning => write!(f, "cleaning"),
            SessionPhase::Done => write!(f, "done"),
        }
    }
}

/// Runs requests through fetch/resolve, test and cleanup.
///
/// A session does no admission control of its own; callers must not run two
/// requests with the same staging name at once. [`crate::WorkerGate`]
/// guarantees that.
#[derive(Debug, Clone)]
pub struct TestSession {
    scratch_root: PathBuf,
    fetcher: PackageFetcher,
    resolver: PackageResolver,
    runner: TestRunner,
}

impl TestSession {
    pub fn new(
        scratch_root: impl Into<PathBuf>,
        fetcher: PackageFetcher,
        resolver: PackageResolver,
        runner: TestRunner,
    ) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            fetcher,
            resolver,
            runner,
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn staging_path(&self, request: &TestRequest) -> PathBuf {
        self.scratch_root.join(request.staging_name())
    }

    pub async fn execute(
        &self,
        request: &TestRequest,
        cancel: &CancellationToken,
    ) -> Result<TestReport, TestError> {
        let span = info_span!(
            "test_session",
            request_id = %request.id(),
            model_id = request.model_id()
        );

        async move {
            debug!(phase = %SessionPhase::Idle, "Session created for {}", request);

            let mut staging = StagingDir::prepare(self.staging_path(request)).await?;
            let outcome = self.stage_and_test(request, &staging, cancel).await;

            debug!(phase = %SessionPhase::Cleaning, "Cleaning up staging directory");
            staging.cleanup().await;

            match &outcome {
                Ok(report) => info!(
                    phase = %SessionPhase::Done,
                    status = report.status().unwrap_or("unknown"),
                    "Test session finished"
                ),
                Err(e) => warn!(
                    phase = %SessionPhase::Done,
                    kind = %e.kind(),
                    "Test session failed: {}", e
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn stage_and_test(
        &self,
        request: &TestRequest,
        staging: &StagingDir,
        cancel: &CancellationToken,
    ) -> Result<TestReport, TestError> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        debug!(phase = %SessionPhase::Staging, path = %staging.path().display(), "Staging package");
        let package = self.stage(request, staging.path(), cancel).await?;
        package.verify().await?;

        debug!(
            phase = %SessionPhase::Testing,
            backend = self.runner.backend_name(),
            "Running test suite"
        );
        // Dropping the run kills the backend's child process.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            report = self.runner.run(package.descriptor_path()) => Ok(report?),
        }
    }

    async fn stage(
        &self,
        request: &TestRequest,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<StagedPackage, TestError> {
        let package = match request.source() {
            PackageSource::Remote(url) => self.fetcher.fetch(url, destination, cancel).await?,
            PackageSource::Local => {
                self.resolver
                    .resolve(request.model_id(), destination, cancel)
                    .await?
            }
        };
        Ok(package)
    }
}

fn cancelled() -> TestError {
    TestError::TestExecution {
        reason: "cancelled by caller".to_string(),
    }
}
