use crate::backend::{BackendError, BackendResult, ModelTestBackend};
use crate::config::CommandBackendConfig;
use crate::types::TestReport;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

/// Test backend that shells out to an external test-suite program.
#[derive(Debug, Clone)]
pub struct CommandTestBackend {
    config: CommandBackendConfig,
}

impl CommandTestBackend {
    pub fn new(config: CommandBackendConfig) -> BackendResult<Self> {
        config
            .validate()
            .map_err(|message| BackendError::InvalidConfig { message })?;
        Ok(Self { config })
    }

    pub fn with_default_config() -> BackendResult<Self> {
        Self::new(CommandBackendConfig::default())
    }

    pub fn config(&self) -> &CommandBackendConfig {
        &self.config
    }

    fn build_command(&self, descriptor_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(descriptor_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd
    }

    /// Reads the report from stdout. The whole output is tried first, then
    /// the last non-empty line, so programs may log before printing the report.
    fn parse_output(program: &str, output: &Output) -> BackendResult<TestReport> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();

        let value = serde_json::from_str::<Value>(trimmed).ok().or_else(|| {
            trimmed
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .and_then(|line| serde_json::from_str::<Value>(line.trim()).ok())
        });

        let Some(value) = value else {
            return Err(BackendError::NoReport {
                program: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        };

        if !output.status.success() {
            warn!(
                program,
                code = output.status.code(),
                "Test program exited unsuccessfully but produced a report"
            );
        }

        TestReport::from_value(value).ok_or(BackendError::MalformedReport)
    }
}

#[async_trait]
impl ModelTestBackend for CommandTestBackend {
    async fn test(&self, descriptor_path: &Path) -> BackendResult<TestReport> {
        debug!(
            program = %self.config.program,
            descriptor = %descriptor_path.display(),
            "Launching test program"
        );

        let output = self
            .build_command(descriptor_path)
            .output()
            .await
            .map_err(|e| BackendError::Launch {
                program: self.config.program.clone(),
                reason: e.to_string(),
            })?;

        Self::parse_output(&self.config.program, &output)
    }

    fn backend_name(&self) -> &'static str {
        "command"
    }
}
