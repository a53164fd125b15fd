use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{render, CommandRunner, Tool};
use crate::error::{Error, Result};

/// Extra time a process gets beyond its own database timeout before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs the tools as child processes on the host.
pub struct ExecRunner {
    timeout: Duration,
}

impl ExecRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn argv(&self, tool: Tool, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        if tool.takes_timeout() {
            argv.push(format!("--timeout={}", self.timeout.as_secs()));
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, tool: Tool, args: &[&str]) -> Result<String> {
        let argv = self.argv(tool, args);
        let command = render(tool, &argv.iter().map(String::as_str).collect::<Vec<_>>());
        let limit = self.timeout + KILL_GRACE;

        let output = tokio::time::timeout(
            limit,
            Command::new(tool.program())
                .args(&argv)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout {
            command: command.clone(),
            timeout: limit,
        })?
        .map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            };
            return Err(Error::Command { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
