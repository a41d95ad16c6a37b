//! Admission control for test sessions.
//!
//! One session runs at a time. Up to `max_queued_requests` more wait in
//! arrival order on a fair semaphore; anything beyond that is turned away
//! with [`TestError::Overload`] without waiting.
//!
//! Admission is split in two so transports can fix the order of requests
//! while reading them: [`WorkerGate::enqueue`] takes the queue place at
//! once, [`Admission::run`] waits for the slot and runs the session.

use crate::config::{ConfigError, ConfigResult, WorkerConfig};
use crate::error::TestError;
use crate::request::TestRequest;
use crate::session::TestSession;
use model::{ModelTestBackend, TestReport, TestRunner, ValidationResult, Validator};
use package::{PackageExporter, PackageFetcher, PackageResolver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time counters for a [`WorkerGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GateStats {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct WorkerGate {
    shared: Arc<GateShared>,
    validator: Validator,
}

/// State that outlives any single caller: running sessions keep it alive.
#[derive(Debug)]
struct GateShared {
    session: TestSession,
    slot: Arc<Semaphore>,
    max_ongoing: usize,
    queue_capacity: usize,
    outstanding: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Holds a place among the admitted requests until dropped.
struct Ticket {
    shared: Arc<GateShared>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ActiveGuard {
    shared: Arc<GateShared>,
}

impl ActiveGuard {
    fn enter(shared: Arc<GateShared>) -> Self {
        shared.active.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

type SlotWait = Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// An admitted request holding its place in the queue.
///
/// Dropping it before [`Admission::run`] gives the place up. Once running,
/// the session lives on its own task: dropping the `run` future cancels the
/// session, which still cleans up and keeps the slot until it has.
pub struct Admission {
    shared: Arc<GateShared>,
    ticket: Ticket,
    request: TestRequest,
    slot: SlotWait,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Admission {
    pub fn request(&self) -> &TestRequest {
        &self.request
    }

    pub async fn run(self) -> Result<TestReport, TestError> {
        let Admission {
            shared,
            ticket,
            request,
            slot,
        } = self;

        let permit = slot.await.map_err(|_| TestError::TestExecution {
            reason: "worker is shutting down".to_string(),
        })?;
        debug!(request_id = %request.id(), "Session slot acquired");

        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let request_id = request.id();

        let session = tokio::spawn(async move {
            // Dropped in reverse order: the slot is freed last.
            let _permit = permit;
            let _ticket = ticket;
            let _active = ActiveGuard::enter(shared.clone());

            let outcome = shared.session.execute(&request, &cancel).await;
            match &outcome {
                Ok(_) => shared.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => shared.failed.fetch_add(1, Ordering::Relaxed),
            };
            outcome
        });

        match session.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(request_id = %request_id, "Session task failed: {}", e);
                Err(TestError::TestExecution {
                    reason: format!("session task failed: {}", e),
                })
            }
        }
    }
}

impl WorkerGate {
    pub fn new(
        config: &WorkerConfig,
        session: TestSession,
        validator: Validator,
    ) -> ConfigResult<Self> {
        config
            .validate()
            .map_err(|message| ConfigError::Invalid { message })?;

        Ok(Self {
            shared: Arc::new(GateShared {
                session,
                slot: Arc::new(Semaphore::new(config.max_ongoing_requests)),
                max_ongoing: config.max_ongoing_requests,
                queue_capacity: config.max_queued_requests,
                outstanding: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            validator,
        })
    }

    /// Wires the default fetcher, resolver and validator around the given
    /// packaging and test backends.
    pub fn from_config(
        config: &WorkerConfig,
        exporter: Arc<dyn PackageExporter>,
        backend: Arc<dyn ModelTestBackend>,
    ) -> ConfigResult<Self> {
        let fetcher = PackageFetcher::new(config.download_timeout(), &config.descriptor_file_name)
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;
        let resolver = PackageResolver::new(exporter, &config.descriptor_file_name);
        let session = TestSession::new(
            &config.scratch_root,
            fetcher,
            resolver,
            TestRunner::new(backend),
        );

        let gate = Self::new(config, session, Validator::default())?;
        info!(
            scratch_root = %config.scratch_root.display(),
            max_queued_requests = config.max_queued_requests,
            num_replicas = config.num_replicas,
            "Worker gate ready"
        );
        Ok(gate)
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue_capacity
    }

    pub fn session(&self) -> &TestSession {
        &self.shared.session
    }

    /// Runs `request` once every earlier admitted request has finished.
    ///
    /// Returns [`TestError::Overload`] straight away when the queue is full.
    /// Dropping the returned future while it waits gives up the queue slot
    /// and touches nothing on disk.
    pub async fn submit(&self, request: TestRequest) -> Result<TestReport, TestError> {
        self.enqueue(request).await?.run().await
    }

    /// Admits `request` and takes its place in the queue without waiting.
    ///
    /// Requests run in the order their `enqueue` calls returned, whichever
    /// order their [`Admission::run`] futures are later polled in.
    pub async fn enqueue(&self, request: TestRequest) -> Result<Admission, TestError> {
        let ticket = self.admit(&request)?;

        let mut slot: SlotWait = Box::pin(self.shared.slot.clone().acquire_owned());
        // Polling once registers the waiter, which fixes its FIFO position.
        if let Poll::Ready(acquired) = futures::poll!(&mut slot) {
            slot = Box::pin(std::future::ready(acquired));
        }

        Ok(Admission {
            shared: self.shared.clone(),
            ticket,
            request,
            slot,
        })
    }

    /// Checks a descriptor without touching the session slot.
    pub fn submit_validation(&self, descriptor: &Value) -> ValidationResult {
        self.validator.validate(descriptor)
    }

    pub fn stats(&self) -> GateStats {
        let shared = &self.shared;
        let outstanding = shared.outstanding.load(Ordering::Acquire);
        let active = shared.active.load(Ordering::Acquire);
        GateStats {
            active,
            queued: outstanding.saturating_sub(active),
            completed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, request: &TestRequest) -> Result<Ticket, TestError> {
        let shared = &self.shared;
        let limit = shared.max_ongoing + shared.queue_capacity;
        let admitted = shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            });

        match admitted {
            Ok(ahead) => {
                info!(
                    request_id = %request.id(),
                    model_id = request.model_id(),
                    ahead,
                    "Request admitted"
                );
                Ok(Ticket {
                    shared: shared.clone(),
                })
            }
            Err(_) => {
                shared.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %request.id(),
                    model_id = request.model_id(),
                    capacity = shared.queue_capacity,
                    "Request rejected, queue is full"
                );
                Err(TestError::Overload {
                    capacity: shared.queue_capacity,
                })
            }
        }
    }
}
