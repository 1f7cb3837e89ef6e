//! Pre/post-run hook commands.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AppResult, RunControlError};

/// Runs the shell commands attached to sequence steps.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Runs `command`, failing unless it exits successfully.
    async fn run(&self, command: &str) -> AppResult<()>;
}

/// Runs hooks through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellHooks;

#[async_trait]
impl HookRunner for ShellHooks {
    async fn run(&self, command: &str) -> AppResult<()> {
        debug!(%command, "Running hook");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .map_err(|e| RunControlError::HookFailed {
                command: command.to_string(),
                detail: e.to_string(),
            })?;
        if !status.success() {
            return Err(RunControlError::HookFailed {
                command: command.to_string(),
                detail: format!("exited with {status}"),
            });
        }
        info!(%command, "Hook completed");
        Ok(())
    }
}
