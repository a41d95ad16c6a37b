//! Single-slot model testing worker.
//!
//! A [`WorkerGate`] admits `test_model` requests one at a time, queueing a
//! bounded number of waiters in arrival order. Each admitted request runs as
//! a [`TestSession`]: stage the package, run its tests, remove the staging
//! directory. `validate` calls bypass the gate entirely.

pub mod config;
pub mod error;
pub mod gate;
pub mod request;
pub mod service;
pub mod session;

pub use config::{ConfigError, ConfigResult, WorkerConfig};
pub use error::{ErrorKind, ErrorPayload, TestError};
pub use gate::{Admission, GateStats, WorkerGate};
pub use request::{staging_name, PackageSource, TestRequest};
pub use service::{
    parse_descriptor, Dispatch, ModelTesterService, ServiceCall, ServiceResponse, TaggedCall,
    TaggedResponse,
};
pub use session::{SessionPhase, TestSession};
