//! Full-state snapshot fetched by running an external command.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot command is empty")]
    EmptyCommand,
    #[error("failed to run snapshot command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("snapshot command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("snapshot command timed out after {0:?}")]
    Timeout(Duration),
    #[error("snapshot output is not JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Runs a shell command whose stdout is a JSON snapshot of the dashboard.
#[derive(Debug, Clone)]
pub struct CommandSnapshotFetcher {
    command: String,
    timeout: Duration,
}

impl CommandSnapshotFetcher {
    pub fn new(command: impl Into<String>) -> Result<Self, SnapshotError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(SnapshotError::EmptyCommand);
        }
        Ok(Self {
            command,
            timeout: DEFAULT_SNAPSHOT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn fetch(&self) -> Result<Value, SnapshotError> {
        let run = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| SnapshotError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(SnapshotError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
