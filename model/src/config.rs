use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How to invoke an external test-suite program.
///
/// The program is called as `<program> <args...> <descriptor_path>` and must
/// print its report as a single JSON object on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandBackendConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
}

impl Default for CommandBackendConfig {
    fn default() -> Self {
        Self {
            program: "bioimageio".to_string(),
            args: vec!["test".to_string()],
            working_dir: None,
            env_vars: Vec::new(),
        }
    }
}

impl CommandBackendConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env_vars: Vec::new(),
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

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.program.trim().is_empty() {
            return Err("Test program cannot be empty".to_string());
        }

        if self.env_vars.iter().any(|(key, _)| key.is_empty() || key.contains('=')) {
            return Err("Environment variable names must be non-empty and contain no '='".to_string());
        }

        if let Some(dir) = &self.working_dir {
            if dir.as_os_str().is_empty() {
                return Err("Working directory cannot be empty".to_string());
            }
        }

        Ok(())
    }
}
