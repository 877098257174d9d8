//! Remote command execution and file transfer.
//!
//! Every call opens a fresh session through a [`RemoteShell`]; there is no
//! session pooling. [`RemoteExecutor`] layers the retry rules on top:
//! - Commands and readiness polls retry transient failures forever
//! - Uploads and downloads retry a bounded number of times, then give up
//!   and report [`Transfer::Abandoned`] instead of failing
//! - A changed host key is forgotten and the call retried, since fresh
//!   instances often reuse an address with a new key

mod ssh;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use osc_retry::{retry, RetryError, RetryPolicy};
use thiserror::Error;
use tracing::{debug, warn};

pub use ssh::SshShell;

/// Retry policy for commands and readiness polls.
pub const COMMAND_RETRY: RetryPolicy = RetryPolicy::unbounded(Duration::from_secs(5));

/// Retry policy for uploads and downloads.
pub const TRANSFER_RETRY: RetryPolicy = RetryPolicy::bounded(5, Duration::from_secs(3));

/// Remote-shell errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{host}: remote host key changed")]
    HostKeyChanged { host: String },

    #[error("{host}: unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("{operation} on {host} failed: {message}")]
    Failed {
        host: String,
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Returns true for failures expected while a host is booting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HostKeyChanged { .. } | Self::Unreachable { .. })
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Readiness check: either stream, trimmed, is exactly `true`.
    pub fn is_true(&self) -> bool {
        self.stdout.trim() == "true" || self.stderr.trim() == "true"
    }
}

/// Outcome of a bounded transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Completed,
    Abandoned { attempts: u32 },
}

/// One remote-shell session per call.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// Drop the cached host key so the next session accepts a new one.
    async fn forget_host_key(&self, host: &str) -> Result<(), RemoteError>;
}

/// Retrying front-end over a [`RemoteShell`].
#[derive(Clone)]
pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    command_retry: RetryPolicy,
    transfer_retry: RetryPolicy,
}

impl RemoteExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            command_retry: COMMAND_RETRY,
            transfer_retry: TRANSFER_RETRY,
        }
    }

    pub fn with_policies(
        mut self,
        command_retry: RetryPolicy,
        transfer_retry: RetryPolicy,
    ) -> Self {
        self.command_retry = command_retry;
        self.transfer_retry = transfer_retry;
        self
    }

    /// Run `command` on `host`. A non-zero exit status is not an error.
    pub async fn run(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        debug!(host, command, "Running remote command");
        retry(
            &self.command_retry,
            "ssh exec",
            move |_| async move {
                let result = self.shell.exec(host, command).await;
                self.on_failure(host, result).await
            },
            RemoteError::is_transient,
        )
        .await
        .map_err(RetryError::into_inner)
    }

    /// Copy a local file to `host`.
    pub async fn upload(
        &self,
        host: &str,
        local: &Path,
        remote: &str,
    ) -> Result<Transfer, RemoteError> {
        debug!(host, local = %local.display(), remote, "Uploading file");
        let result = retry(
            &self.transfer_retry,
            "scp upload",
            move |_| async move {
                let result = self.shell.upload(host, local, remote).await;
                self.on_failure(host, result).await
            },
            RemoteError::is_transient,
        )
        .await;
        abandon_exhausted(host, "upload", result)
    }

    /// Copy a file from `host` to a local path.
    pub async fn download(
        &self,
        host: &str,
        remote: &str,
        local: &Path,
    ) -> Result<Transfer, RemoteError> {
        debug!(host, remote, local = %local.display(), "Downloading file");
        let result = retry(
            &self.transfer_retry,
            "scp download",
            move |_| async move {
                let result = self.shell.download(host, remote, local).await;
                self.on_failure(host, result).await
            },
            RemoteError::is_transient,
        )
        .await;
        abandon_exhausted(host, "download", result)
    }

    /// Re-run `command` every `poll_interval` until it prints `true`.
    pub async fn wait_until_true(
        &self,
        host: &str,
        command: &str,
        poll_interval: Duration,
    ) -> Result<(), RemoteError> {
        loop {
            let output = self.run(host, command).await?;
            if output.is_true() {
                debug!(host, command, "Remote check passed");
                return Ok(());
            }
            debug!(host, command, "Remote check not true yet");
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn on_failure<T>(
        &self,
        host: &str,
        result: Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        if let Err(RemoteError::HostKeyChanged { .. }) = &result {
            warn!(host, "Host key changed; forgetting the cached key");
            // The host-key error stays transient even if the cache is stale
            if let Err(e) = self.shell.forget_host_key(host).await {
                warn!(host, error = %e, "Failed to forget host key");
            }
        }
        result
    }
}

fn abandon_exhausted(
    host: &str,
    operation: &str,
    result: Result<(), RetryError<RemoteError>>,
) -> Result<Transfer, RemoteError> {
    match result {
        Ok(()) => Ok(Transfer::Completed),
        Err(RetryError::Exhausted { attempts, last, .. }) => {
            warn!(host, operation, attempts, error = %last, "Giving up on transfer");
            Ok(Transfer::Abandoned { attempts })
        }
        Err(RetryError::Fatal(e)) => Err(e),
    }
}
