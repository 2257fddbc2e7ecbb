//! Remote execution over the system `ssh` binary
//!
//! Each operation spawns one `ssh` process; scripts and file contents travel on
//! stdin so nothing has to be quoted for the remote shell. Every call is bounded
//! by the configured command timeout and the child is killed when the timeout
//! fires.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::traits::{CommandOutput, RemoteExecutor, RemoteSession};
use crate::config::RemoteConfig;
use crate::error::{RelvalError, Result};

#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: RemoteConfig,
}

impl SshExecutor {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession {
            destination: format!("{}@{}", self.config.username, self.config.host),
            options: self.config.ssh_options.clone(),
            timeout: self.config.command_timeout(),
        };
        debug!(destination = %session.destination, "🔌 SSH: Opened session");
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
pub struct SshSession {
    destination: String,
    options: Vec<String>,
    timeout: Duration,
}

impl SshSession {
    async fn run(&self, remote_command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut command = Command::new("ssh");
        command
            .args(&self.options)
            .arg(&self.destination)
            .arg(remote_command);
        self.run_bounded(command, stdin).await
    }

    /// Run `command` feeding it `stdin`; writing the input and collecting the
    /// output both count against the timeout
    async fn run_bounded(&self, mut command: Command, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pipe = child.stdin.take();
        let exchange = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                pipe.write_all(input).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                warn!(
                    destination = %self.destination,
                    timeout_seconds = self.timeout.as_secs(),
                    "⏱️ SSH: Remote command timed out"
                );
                RelvalError::Timeout(format!(
                    "Remote command on {} did not finish within {}s",
                    self.destination,
                    self.timeout.as_secs()
                ))
            })??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn require_success(output: CommandOutput, what: &str) -> Result<CommandOutput> {
        if output.success() {
            Ok(output)
        } else {
            Err(RelvalError::RemoteExecution(format!(
                "{what} failed with exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let content = tokio::fs::read(local).await?;
        debug!(local = %local.display(), remote = %remote, "📤 SSH: Uploading file");
        let output = self
            .run(&format!("cat > '{remote}'"), Some(&content))
            .await?;
        Self::require_success(output, &format!("Upload of {}", local.display()))?;
        Ok(())
    }

    async fn upload_content(&self, content: &str, remote: &str) -> Result<()> {
        debug!(remote = %remote, bytes = content.len(), "📤 SSH: Uploading content");
        let output = self
            .run(&format!("cat > '{remote}'"), Some(content.as_bytes()))
            .await?;
        Self::require_success(output, &format!("Upload to {remote}"))?;
        Ok(())
    }

    async fn download_as_string(&self, remote: &str) -> Result<String> {
        let output = self.run(&format!("cat '{remote}'"), None).await?;
        Ok(Self::require_success(output, &format!("Download of {remote}"))?.stdout)
    }

    async fn execute(&self, commands: &[String]) -> Result<CommandOutput> {
        let script = commands.join("\n");
        debug!(
            destination = %self.destination,
            commands = commands.len(),
            "🖥️ SSH: Executing commands"
        );
        self.run("bash -s", Some(script.as_bytes())).await
    }

    async fn close(&self) -> Result<()> {
        debug!(destination = %self.destination, "🔌 SSH: Closed session");
        Ok(())
    }
}
