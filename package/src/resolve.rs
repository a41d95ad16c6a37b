use crate::staging::StagedPackage;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ExportError {
    /// The packaging backend has never heard of this model
    #[error("Model '{model_id}' is not known to the packaging backend")]
    UnknownModel { model_id: String },

    /// The packaging backend knows the model but could not export it
    #[error("Failed to export model '{model_id}': {reason}")]
    ExportFailed { model_id: String, reason: String },

    /// The export was stopped by the caller
    #[error("Export of model '{model_id}' was cancelled")]
    Cancelled { model_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Local packaging step that materialises a model package as a folder.
#[async_trait]
pub trait PackageExporter: Send + Sync {
    /// Writes the package for `model_id` under `output_path` and returns the
    /// folder that holds it.
    ///
    /// Implementations must stop promptly once `cancel` fires and must not
    /// write to `output_path` after returning.
    async fn export(
        &self,
        model_id: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf>;

    fn exporter_name(&self) -> &'static str;
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Could not resolve model '{model_id}': {reason}")]
    Resolution { model_id: String, reason: String },

    #[error("Resolution of model '{model_id}' was cancelled")]
    Cancelled { model_id: String },
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Materialises packages for requests that carry no download URL.
#[derive(Clone)]
pub struct PackageResolver {
    exporter: Arc<dyn PackageExporter>,
    descriptor_file_name: String,
}

impl PackageResolver {
    pub fn new(
        exporter: Arc<dyn PackageExporter>,
        descriptor_file_name: impl Into<String>,
    ) -> Self {
        Self {
            exporter,
            descriptor_file_name: descriptor_file_name.into(),
        }
    }

    /// Exports `model_id` into `destination`.
    ///
    /// The returned package is not verified; callers check the descriptor
    /// before using it.
    pub async fn resolve(
        &self,
        model_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> ResolveResult<StagedPackage> {
        debug!(
            model_id,
            exporter = self.exporter.exporter_name(),
            destination = %destination.display(),
            "Resolving model package locally"
        );

        let exported = self
            .exporter
            .export(model_id, destination, cancel)
            .await
            .map_err(|e| match e {
                ExportError::Cancelled { model_id } => ResolveError::Cancelled { model_id },
                other => ResolveError::Resolution {
                    model_id: model_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        // Anything outside the staging directory would survive cleanup.
        if !exported.starts_with(destination) {
            return Err(ResolveError::Resolution {
                model_id: model_id.to_string(),
                reason: format!(
                    "exporter wrote to '{}' outside of '{}'",
                    exported.display(),
                    destination.display()
                ),
            });
        }

        info!(model_id, path = %exported.display(), "Model package resolved");
        Ok(StagedPackage::new(exported, &self.descriptor_file_name))
    }
}

impl std::fmt::Debug for PackageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageResolver")
            .field("exporter", &self.exporter.exporter_name())
            .field("descriptor_file_name", &self.descriptor_file_name)
            .finish()
    }
}

/// Exports packages by copying them out of a local model library laid out
/// as `<root>/<model_id>/`.
#[derive(Debug, Clone)]
pub struct LibraryExporter {
    root: PathBuf,
}

impl LibraryExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Recursive copy that checks `cancel` before every entry. Returns `None`
/// when cancelled.
fn copy_tree(
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> std::io::Result<Option<u64>> {
    std::fs::create_dir_all(destination)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(source)? {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let entry = entry?;
        let target = destination.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            match copy_tree(&entry.path(), &target, cancel)? {
                Some(n) => copied += n,
                None => return Ok(None),
            }
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(Some(copied))
}

#[async_trait]
impl PackageExporter for LibraryExporter {
    async fn export(
        &self,
        model_id: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf> {
        let nested = Path::new(model_id)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        let source = self.root.join(model_id);
        let known = nested
            && tokio::fs::metadata(&source)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
        if !known {
            return Err(ExportError::UnknownModel {
                model_id: model_id.to_string(),
            });
        }

        // The copy thread is always joined, even after cancellation, so no
        // file lands in `output_path` once this returns.
        let destination = output_path.to_path_buf();
        let token = cancel.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &destination, &token))
            .await
            .map_err(|e| ExportError::ExportFailed {
                model_id: model_id.to_string(),
                reason: e.to_string(),
            })??
            .ok_or_else(|| ExportError::Cancelled {
                model_id: model_id.to_string(),
            })?;

        debug!(model_id, files = copied, "Copied package from library");
        Ok(output_path.to_path_buf())
    }

    fn exporter_name(&self) -> &'static str {
        "library"
    }
}

/// Exports packages by running an external packaging program as
/// `<program> <args...> <model_id> <output_path>`.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
}

impl CommandExporter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl PackageExporter for CommandExporter {
    async fn export(
        &self,
        model_id: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(model_id)
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExportError::ExportFailed {
                model_id: model_id.to_string(),
                reason: format!("failed to launch '{}': {}", self.program, e),
            })?;

        let stderr = child.stderr.take();
        let read_stderr = async move {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        };

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            finished = async { tokio::join!(child.wait(), read_stderr) } => Some(finished),
        };

        let Some((status, stderr_text)) = finished else {
            // Reap the exporter so it cannot keep writing.
            let _ = child.kill().await;
            return Err(ExportError::Cancelled {
                model_id: model_id.to_string(),
            });
        };
        let status = status?;

        if !status.success() {
            return Err(ExportError::ExportFailed {
                model_id: model_id.to_string(),
                reason: stderr_text.trim().to_string(),
            });
        }

        Ok(output_path.to_path_buf())
    }

    fn exporter_name(&self) -> &'static str {
        "command"
    }
}
