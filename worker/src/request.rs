use crate::error::TestError;
use package::Url;
use std::fmt;
use uuid::Uuid;

/// Where a request's package comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Download and unpack the zip archive at this URL
    Remote(Url),
    /// Export the package locally by model id
    Local,
}

/// One `test_model` call. Immutable once built.
#[derive(Debug, Clone)]
pub struct TestRequest {
    id: Uuid,
    model_id: String,
    source: PackageSource,
}

impl TestRequest {
    /// Builds a request from the raw call arguments. A present `model_url`
    /// selects [`PackageSource::Remote`].
    pub fn new(model_id: impl Into<String>, model_url: Option<&str>) -> Result<Self, TestError> {
        let source = match model_url {
            Some(raw) => {
                let url = Url::parse(raw).map_err(|e| TestError::InvalidRequest {
                    reason: format!("model_url '{}' is not a valid URL: {}", raw, e),
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(TestError::InvalidRequest {
                        reason: format!("model_url scheme '{}' is not supported", url.scheme()),
                    });
                }
                PackageSource::Remote(url)
            }
            None => PackageSource::Local,
        };
        Self::with_source(model_id, source)
    }

    pub fn local(model_id: impl Into<String>) -> Result<Self, TestError> {
        Self::with_source(model_id, PackageSource::Local)
    }

    pub fn remote(model_id: impl Into<String>, url: Url) -> Result<Self, TestError> {
        Self::with_source(model_id, PackageSource::Remote(url))
    }

    fn with_source(model_id: impl Into<String>, source: PackageSource) -> Result<Self, TestError> {
        let model_id = model_id.into();
        if model_id.trim().is_empty() {
            return Err(TestError::InvalidRequest {
                reason: "model_id cannot be empty".to_string(),
            });
        }
        if matches!(staging_name(&model_id).as_str(), "." | "..") {
            return Err(TestError::InvalidRequest {
                reason: format!("model_id '{}' cannot name a staging directory", model_id),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            model_id,
            source,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    /// Directory name for this request under the scratch root.
    pub fn staging_name(&self) -> String {
        staging_name(&self.model_id)
    }
}

impl fmt::Display for TestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            PackageSource::Remote(url) => write!(f, "{} from {}", self.model_id, url),
            PackageSource::Local => write!(f, "{} (local)", self.model_id),
        }
    }
}

/// Maps a model id onto a single path component. Anything outside
/// `[A-Za-z0-9._-]` becomes `_`.
pub fn staging_name(model_id: &str) -> String {
    model_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
