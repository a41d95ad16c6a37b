pub mod backend;
#[cfg(feature = "command")]
pub mod command;
pub mod config;
pub mod rdf;
pub mod runner;
pub mod types;
pub mod validator;

pub use backend::{BackendError, BackendResult, FormatValidator, ModelTestBackend};
pub use config::CommandBackendConfig;
pub use rdf::RdfFormatValidator;
pub use runner::{RunnerError, RunnerResult, TestRunner};
pub use types::{
    FormatIssue, FormatStatus, FormatSummary, TestReport, ValidationContext, ValidationResult,
};
pub use validator::Validator;

#[cfg(feature = "command")]
pub use command::CommandTestBackend;

pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::rdf::*;
    pub use crate::runner::*;
    pub use crate::types::*;
    pub use crate::validator::*;

    #[cfg(feature = "command")]
    pub use crate::command::*;
}
