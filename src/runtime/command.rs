use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::{MeshError, Result};
use crate::protocol::FetchDirective;
use crate::runtime::work::FetchExecutor;

/// Fetches by running a shell command and taking its stdout.
///
/// The command is the directive's target: either a string, or an object with
/// a `command` string. The child is killed if the fetch is cancelled or
/// times out. `FETCH_INDEX` and `FETCH_OF` are exported to the command.
#[derive(Debug, Clone)]
pub struct CommandFetch {
    config: FetchConfig,
}

impl CommandFetch {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    fn command_for(directive: &FetchDirective) -> Result<String> {
        match directive.target() {
            Value::String(command) => Ok(command.clone()),
            Value::Object(fields) => fields
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| MeshError::Internal("fetch target has no command".to_string())),
            other => Err(MeshError::Internal(format!(
                "fetch target is not a command: {}",
                other
            ))),
        }
    }

    fn process_output(index: usize, output: std::process::Output) -> Result<Value> {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        tracing::info!(
            index,
            exit_code = ?exit_code,
            bytes = stdout.len(),
            "Fetch command finished"
        );

        if output.status.success() {
            Ok(Value::String(stdout))
        } else if stderr.is_empty() {
            Err(MeshError::Internal(format!("exit code: {:?}", exit_code)))
        } else {
            Err(MeshError::Internal(stderr.trim_end().to_string()))
        }
    }
}

#[async_trait]
impl FetchExecutor for CommandFetch {
    async fn fetch(&self, directive: &FetchDirective, cancel: &CancellationToken) -> Result<Value> {
        let command = Self::command_for(directive)?;
        tracing::info!(
            index = directive.index,
            of = directive.of,
            command = %command,
            "Running fetch command"
        );

        let child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&command)
            .env("FETCH_INDEX", directive.index.to_string())
            .env("FETCH_OF", directive.of.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MeshError::Internal(format!("failed to start fetch command: {}", e)))?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(index = directive.index, "Fetch command cancelled");
                Err(MeshError::Internal("fetch cancelled".to_string()))
            }
            output = tokio::time::timeout(timeout, child.wait_with_output()) => match output {
                Ok(Ok(output)) => Self::process_output(directive.index, output),
                Ok(Err(e)) => {
                    tracing::error!(index = directive.index, error = %e, "Fetch command failed");
                    Err(MeshError::Internal(e.to_string()))
                }
                Err(_) => Err(MeshError::Internal(format!(
                    "fetch command timed out after {}ms",
                    self.config.timeout_ms
                ))),
            },
        }
    }
}
