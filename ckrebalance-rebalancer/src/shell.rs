//! Remote shell access to shard hosts

use async_trait::async_trait;
use ckrebalance_core::BoxError;
use ckrebalance_remote::{remote_execute, SshOptions};
use thiserror::Error;

/// A shell command that could not be run or exited non-zero
#[derive(Error, Debug)]
#[error("Command on {host} failed: {command}")]
pub struct ShellError {
    pub host: String,
    pub command: String,
    #[source]
    pub source: BoxError,
}

impl ShellError {
    pub fn new(host: &str, command: &str, source: impl Into<BoxError>) -> Self {
        Self {
            host: host.to_string(),
            command: command.to_string(),
            source: source.into(),
        }
    }
}

/// Runs shell commands on a shard host and returns their output
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, host: &str, cmd: &str) -> Result<String, ShellError>;
}

/// [`RemoteShell`] that opens one SSH session per command
#[derive(Debug, Clone)]
pub struct SshRemoteShell {
    template: SshOptions,
}

impl SshRemoteShell {
    /// `template.host` is ignored; every call supplies its own host
    pub fn new(template: SshOptions) -> Self {
        Self { template }
    }

    pub fn options_for(&self, host: &str) -> SshOptions {
        SshOptions {
            host: host.to_string(),
            ..self.template.clone()
        }
    }
}

#[async_trait]
impl RemoteShell for SshRemoteShell {
    async fn run(&self, host: &str, cmd: &str) -> Result<String, ShellError> {
        let options = self.options_for(host);
        remote_execute(&options, cmd)
            .await
            .map_err(|e| ShellError::new(host, cmd, e))
    }
}
