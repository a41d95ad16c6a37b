//! Staging directories: the scratch location holding one request's package.
//!
//! A [`StagingDir`] owns its path for the lifetime of a test session and is
//! removed with [`StagingDir::cleanup`] when the session ends. Dropping the
//! guard without cleanup still removes the directory, synchronously.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StagingError {
    /// The package was staged but has no descriptor at the expected location
    #[error("Descriptor '{path}' not found in staged package")]
    DescriptorMissing { path: PathBuf },

    /// The staging directory disappeared before it could be used
    #[error("Staging directory '{path}' does not exist")]
    DirectoryMissing { path: PathBuf },

    /// Preparing the staging location failed
    #[error("Failed to prepare staging directory '{path}': {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StagingResult<T> = Result<T, StagingError>;

/// A model package laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPackage {
    root_path: PathBuf,
    descriptor_path: PathBuf,
}

impl StagedPackage {
    pub fn new(root_path: impl Into<PathBuf>, descriptor_file_name: &str) -> Self {
        let root_path = root_path.into();
        let descriptor_path = root_path.join(descriptor_file_name);
        Self {
            root_path,
            descriptor_path,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    /// Confirms the package root and its descriptor are present.
    pub async fn verify(&self) -> StagingResult<()> {
        if !tokio::fs::try_exists(&self.root_path).await.unwrap_or(false) {
            return Err(StagingError::DirectoryMissing {
                path: self.root_path.clone(),
            });
        }

        match tokio::fs::metadata(&self.descriptor_path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(StagingError::DescriptorMissing {
                path: self.descriptor_path.clone(),
            }),
        }
    }
}

/// Path of the temporary archive a download for `destination` is written to.
pub fn archive_path_for(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(".zip");
    PathBuf::from(name)
}

/// Recursively removes `path`. Removing something that is already gone is
/// not an error.
pub async fn remove_staging_path(path: &Path) -> std::io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Exclusive handle on one request's staging location.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    needs_cleanup: bool,
}

impl StagingDir {
    /// Claims `path` for a new session.
    ///
    /// Leftovers from a previous run (directory or downloaded archive) are
    /// removed first. The parent directory is created; the path itself is
    /// left for the fetcher or resolver to populate.
    pub async fn prepare(path: impl Into<PathBuf>) -> StagingResult<Self> {
        let path = path.into();

        for stale in [path.clone(), archive_path_for(&path)] {
            if tokio::fs::try_exists(&stale).await.unwrap_or(false) {
                warn!(path = %stale.display(), "Removing orphaned staging data from a previous run");
                remove_staging_path(&stale)
                    .await
                    .map_err(|source| StagingError::Prepare {
                        path: stale.clone(),
                        source,
                    })?;
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StagingError::Prepare {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        debug!(path = %path.display(), "Staging directory claimed");
        Ok(Self {
            path,
            needs_cleanup: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_path(&self) -> PathBuf {
        archive_path_for(&self.path)
    }

    /// Best-effort removal of the staging directory and any leftover archive.
    ///
    /// Failures are logged and reported through the return value but never
    /// turned into errors. Calling this more than once is harmless.
    pub async fn cleanup(&mut self) -> bool {
        let mut clean = true;
        for target in [self.path.clone(), self.archive_path()] {
            if let Err(e) = remove_staging_path(&target).await {
                warn!(path = %target.display(), "Failed to remove staging data: {}", e);
                clean = false;
            }
        }

        if clean {
            debug!(path = %self.path.display(), "Staging directory removed");
        }
        self.needs_cleanup = !clean;
        clean
    }
}

/// Last resort for a guard that never reached [`StagingDir::cleanup`], e.g.
/// when the session task panicked. Blocks the current thread.
impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.needs_cleanup {
            warn!(path = %self.path.display(), "Staging directory dropped without cleanup");
            let _ = std::fs::remove_dir_all(&self.path);
            let _ = std::fs::remove_file(archive_path_for(&self.path));
        }
    }
}
