//! Model package staging for bioengine-worker
//!
//! A test session needs its model package laid out on local disk. Packages
//! arrive either as a zip archive downloaded from a URL ([`PackageFetcher`])
//! or through a local packaging step keyed by model id ([`PackageResolver`]).
//! Either way they land in a [`StagingDir`] that is removed when the session
//! ends.

pub mod fetch;
pub mod resolve;
pub mod staging;

pub use fetch::{FetchError, FetchResult, PackageFetcher};
pub use resolve::{
    CommandExporter, ExportError, ExportResult, LibraryExporter, PackageExporter, PackageResolver,
    ResolveError, ResolveResult,
};
pub use staging::{
    archive_path_for, remove_staging_path, StagedPackage, StagingDir, StagingError, StagingResult,
};

pub use reqwest::Url;

/// File name of the descriptor at the root of every model package.
pub const DESCRIPTOR_FILE_NAME: &str = "rdf.yaml";
