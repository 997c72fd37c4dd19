//! Process execution behind a trait so callers can be tested without binaries.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Captured output of a successful command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. A non-zero exit is an [`Error::Command`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs real processes with a hard timeout.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(29))
    }
}

fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command = render(program, args);
        debug!(command = %command, "Running command");

        let child = Command::new(program).args(args).kill_on_drop(true).output();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Command {
                    command,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(Error::Command {
                    command,
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            return Err(Error::Command {
                command,
                message: message.trim().to_string(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}
