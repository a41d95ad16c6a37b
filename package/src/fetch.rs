use crate::staging::{archive_path_for, remove_staging_path, StagedPackage};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Errors raised while downloading and unpacking a remote package
#[derive(Error, Debug)]
pub enum FetchError {
    /// Non-2xx response or transport failure
    #[error("Failed to download model from {url}: {reason}")]
    Download {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// The downloaded archive could not be extracted
    #[error("Archive '{archive}' is not a valid model package: {reason}")]
    PackageFormat { archive: PathBuf, reason: String },

    /// The HTTP client could not be constructed
    #[error("Invalid fetcher configuration: {message}")]
    InvalidConfig { message: String },

    /// Local filesystem failure while writing or extracting
    #[error("IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller went away before the package was unpacked
    #[error("Package download was cancelled")]
    Cancelled,
}

impl FetchError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn format(archive: &Path) -> impl FnOnce(zip::result::ZipError) -> Self + '_ {
        move |e| FetchError::PackageFormat {
            archive: archive.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Downloads zipped model packages and unpacks them into a staging directory.
#[derive(Debug, Clone)]
pub struct PackageFetcher {
    client: reqwest::Client,
    descriptor_file_name: String,
}

impl PackageFetcher {
    /// `timeout` bounds each whole request; `None` leaves timing to the caller.
    pub fn new(timeout: Option<Duration>, descriptor_file_name: impl Into<String>) -> FetchResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| FetchError::InvalidConfig {
            message: format!("Failed to build HTTP client: {}", e),
        })?;

        Ok(Self {
            client,
            descriptor_file_name: descriptor_file_name.into(),
        })
    }

    /// Downloads `model_url` and extracts it into `destination`.
    ///
    /// The archive is written next to `destination` and removed once
    /// extraction has finished, whether or not extraction succeeded.
    ///
    /// Cancelling `cancel` aborts the download at once and stops extraction
    /// before the next archive entry. Either way this only returns after the
    /// extraction thread has finished, so nothing is written to
    /// `destination` afterwards.
    pub async fn fetch(
        &self,
        model_url: &Url,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> FetchResult<StagedPackage> {
        let url = model_url.to_string();
        debug!(url = %url, destination = %destination.display(), "Downloading model package");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(model_url.clone()).send() => response,
        }
        .map_err(|e| FetchError::Download {
            url: url.clone(),
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Download {
                url,
                status: Some(status.as_u16()),
                reason: format!("HTTP {}", status),
            });
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            body = response.bytes() => body,
        }
        .map_err(|e| FetchError::Download {
            url: url.clone(),
            status: Some(status.as_u16()),
            reason: format!("failed to read response body: {}", e),
        })?;

        let archive = archive_path_for(destination);
        if let Some(parent) = archive.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FetchError::io(parent))?;
        }
        tokio::fs::write(&archive, &body)
            .await
            .map_err(FetchError::io(&archive))?;
        debug!(bytes = body.len(), archive = %archive.display(), "Archive written");

        let extraction = {
            let archive = archive.clone();
            let destination = destination.to_path_buf();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || extract_archive(&archive, &destination, &cancel))
                .await
        };

        if let Err(e) = remove_staging_path(&archive).await {
            warn!(archive = %archive.display(), "Failed to remove downloaded archive: {}", e);
        }

        let entries = extraction.map_err(|e| FetchError::PackageFormat {
            archive: archive.clone(),
            reason: format!("extraction task failed: {}", e),
        })??;

        info!(url = %url, entries, destination = %destination.display(), "Model package unpacked");
        Ok(StagedPackage::new(destination, &self.descriptor_file_name))
    }
}

/// Extracts every entry of `archive` into `destination`, returning the entry
/// count. Entries whose names would escape `destination` are rejected.
/// `cancel` is checked before each entry.
fn extract_archive(
    archive: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> FetchResult<usize> {
    let file = std::fs::File::open(archive).map_err(FetchError::io(archive))?;
    let mut zip = ZipArchive::new(file).map_err(FetchError::format(archive))?;

    std::fs::create_dir_all(destination).map_err(FetchError::io(destination))?;

    for index in 0..zip.len() {
        if cancel.is_cancelled() {
            debug!(archive = %archive.display(), extracted = index, "Extraction cancelled");
            return Err(FetchError::Cancelled);
        }

        let mut entry = zip.by_index(index).map_err(FetchError::format(archive))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(FetchError::PackageFormat {
                archive: archive.to_path_buf(),
                reason: format!("entry '{}' escapes the package root", entry.name()),
            });
        };

        let target = destination.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(FetchError::io(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(FetchError::io(parent))?;
        }
        let mut out = std::fs::File::create(&target).map_err(FetchError::io(&target))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| FetchError::PackageFormat {
            archive: archive.to_path_buf(),
            reason: format!("failed to unpack '{}': {}", entry.name(), e),
        })?;
    }

    Ok(zip.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn fetcher() -> PackageFetcher {
        PackageFetcher::new(Some(Duration::from_secs(10)), "rdf.yaml").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_extracts_package() {
        let mut server = mockito::Server::new_async().await;
        let body = zip_bytes(&[
            ("rdf.yaml", b"type: model\nname: demo\n"),
            ("weights/model.pt", b"weights"),
        ]);
        let _mock = server
            .mock("GET", "/demo.zip")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let destination = scratch.path().join("demo");
        let url = Url::parse(&format!("{}/demo.zip", server.url())).unwrap();

        let package = fetcher().fetch(&url, &destination, &CancellationToken::new()).await.unwrap();
        assert_eq!(package.root_path(), destination.as_path());
        assert!(package.descriptor_path().is_file());
        assert!(destination.join("weights").join("model.pt").is_file());
        assert!(!archive_path_for(&destination).exists());
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.zip")
            .with_status(404)
            .create_async()
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let destination = scratch.path().join("missing");
        let url = Url::parse(&format!("{}/missing.zip", server.url())).unwrap();

        match fetcher().fetch(&url, &destination, &CancellationToken::new()).await {
            Err(FetchError::Download { url: failed, status, .. }) => {
                assert_eq!(status, Some(404));
                assert!(failed.ends_with("/missing.zip"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!destination.exists());
        assert!(!archive_path_for(&destination).exists());
    }

    #[tokio::test]
    async fn test_fetch_corrupt_archive() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/broken.zip")
            .with_status(200)
            .with_body("this is not a zip file")
            .create_async()
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let destination = scratch.path().join("broken");
        let url = Url::parse(&format!("{}/broken.zip", server.url())).unwrap();

        let result = fetcher().fetch(&url, &destination, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::PackageFormat { .. })));
        assert!(!archive_path_for(&destination).exists());
    }

    #[tokio::test]
    async fn test_fetch_truncated_archive() {
        let mut server = mockito::Server::new_async().await;
        let mut body = zip_bytes(&[("rdf.yaml", b"type: model\n")]);
        body.truncate(body.len() / 2);
        let _mock = server
            .mock("GET", "/partial.zip")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let destination = scratch.path().join("partial");
        let url = Url::parse(&format!("{}/partial.zip", server.url())).unwrap();

        let result = fetcher().fetch(&url, &destination, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FetchError::PackageFormat { .. })));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let scratch = tempfile::tempdir().unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let url = Url::parse("http://127.0.0.1:9/demo.zip").unwrap();
        let result = fetcher()
            .fetch(&url, &scratch.path().join("demo"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(FetchError::Download { status: None, .. })
        ));
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("evil.zip");
        std::fs::write(&archive, zip_bytes(&[("../escape.txt", b"gotcha")])).unwrap();

        let destination = scratch.path().join("out");
        let result = extract_archive(&archive, &destination, &CancellationToken::new());
        assert!(matches!(result, Err(FetchError::PackageFormat { .. })));
        assert!(!scratch.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_stops_when_cancelled() {
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("demo.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("rdf.yaml", b"type: model\n"), ("weights/model.pt", b"weights")]),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let destination = scratch.path().join("demo");
        let result = extract_archive(&archive, &destination, &cancel);

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(std::fs::read_dir(&destination).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_cancelled_before_download() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/demo.zip")
            .with_status(200)
            .with_body(zip_bytes(&[("rdf.yaml", b"type: model\n")]))
            .expect(0)
            .create_async()
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let destination = scratch.path().join("demo");
        let url = Url::parse(&format!("{}/demo.zip", server.url())).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetcher().fetch(&url, &destination, &cancel).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(!destination.exists());
        assert!(!archive_path_for(&destination).exists());
        mock.assert_async().await;
    }
}
