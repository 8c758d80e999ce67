//! Bulk data transfer between backends

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use govstore_core::model::BackendConfig;
use govstore_core::{Error, Result};

/// Copies every table of `source` into `destination`.
///
/// Implementations report tool diagnostics in the error message; the
/// orchestrator wraps them into `Error::Migration`.
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    async fn transfer(&self, source: &BackendConfig, destination: &BackendConfig) -> Result<()>;
}

/// Runs an external program as `<program> <source-uri> <destination-uri>`
#[derive(Debug, Clone)]
pub struct CommandTransfer {
    program: String,
}

impl CommandTransfer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for CommandTransfer {
    fn default() -> Self {
        Self::new("pgloader")
    }
}

#[async_trait]
impl BulkTransfer for CommandTransfer {
    async fn transfer(&self, source: &BackendConfig, destination: &BackendConfig) -> Result<()> {
        let source_uri = source.transfer_uri()?;
        let destination_uri = destination.transfer_uri()?;

        info!(
            "Running {}: {} -> {}",
            self.program,
            source.describe(),
            destination.describe()
        );

        let output = Command::new(&self.program)
            .arg(&source_uri)
            .arg(&destination_uri)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Storage(format!("Failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("{} stdout: {}", self.program, stdout.trim());

        if !output.status.success() {
            let diagnostics = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(Error::Storage(format!(
                "{} exited with {}: {}",
                self.program, output.status, diagnostics
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_program() {
        assert_eq!(CommandTransfer::default().program(), "pgloader");
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let transfer = CommandTransfer::new("govstore-no-such-transfer-tool");
        let err = transfer
            .transfer(
                &BackendConfig::sqlite("/tmp/a.db"),
                &BackendConfig::sqlite("/tmp/b.db"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let transfer = CommandTransfer::new("false");
        let err = transfer
            .transfer(
                &BackendConfig::sqlite("/tmp/a.db"),
                &BackendConfig::sqlite("/tmp/b.db"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }
}
