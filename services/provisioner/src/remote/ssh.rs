//! [`RemoteShell`] backed by the system `ssh`, `scp` and `ssh-keygen`.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, RemoteError, RemoteShell};
use crate::config::ProxyConfig;

/// Exit status ssh reserves for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

const HOST_KEY_MARKERS: &[&str] = &[
    "REMOTE HOST IDENTIFICATION HAS CHANGED",
    "Host key verification failed",
];

const UNREACHABLE_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "Operation timed out",
    "No route to host",
    "Connection reset",
    "Connection closed",
    "Network is unreachable",
    "Could not resolve hostname",
];

/// Remote shell that spawns OpenSSH client processes.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    key_path: PathBuf,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
    known_hosts: Option<PathBuf>,
}

impl SshShell {
    pub fn new(user: &str, key_path: PathBuf) -> Self {
        Self {
            user: user.to_string(),
            key_path,
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            known_hosts: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Use a dedicated known-hosts file instead of the user's.
    pub fn with_known_hosts(mut self, path: PathBuf) -> Self {
        self.known_hosts = Some(path);
        self
    }

    /// Options shared by ssh and scp.
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];

        if let Some(known_hosts) = &self.known_hosts {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }

        if let Some(proxy) = &self.proxy {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={}", proxy_command(proxy)));
        }

        args
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{host}", self.user)
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Output, RemoteError> {
        debug!(program, ?args, "Spawning");
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Io {
                operation: "spawn",
                source,
            })
    }

    async fn scp(
        &self,
        host: &str,
        from: String,
        to: String,
        operation: &'static str,
    ) -> Result<(), RemoteError> {
        let mut args = self.common_args();
        args.push("-q".to_string());
        args.push(from);
        args.push(to);

        let output = self.spawn("scp", &args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify(
            host,
            operation,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut args = self.common_args();
        args.push(self.target(host));
        args.push(command.to_string());

        let output = self.spawn("ssh", &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.code() == Some(SSH_ERROR_STATUS) {
            return Err(classify(host, "exec", &stderr));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let from = local.display().to_string();
        let to = format!("{}:{remote}", self.target(host));
        self.scp(host, from, to, "upload").await
    }

    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let from = format!("{}:{remote}", self.target(host));
        let to = local.display().to_string();
        self.scp(host, from, to, "download").await
    }

    async fn forget_host_key(&self, host: &str) -> Result<(), RemoteError> {
        let mut args = vec!["-R".to_string(), host.to_string()];
        if let Some(known_hosts) = &self.known_hosts {
            args.push("-f".to_string());
            args.push(known_hosts.display().to_string());
        }

        let output = self.spawn("ssh-keygen", &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Failed {
                host: host.to_string(),
                operation: "forget_host_key",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// ProxyCommand tunnelling through an HTTP CONNECT proxy.
fn proxy_command(proxy: &ProxyConfig) -> String {
    match (&proxy.username, &proxy.password) {
        (Some(user), Some(password)) => format!(
            "proxytunnel -q -p {}:{} -P {user}:{password} -d %h:%p",
            proxy.host, proxy.port
        ),
        (Some(user), None) => format!(
            "proxytunnel -q -p {}:{} -P {user} -d %h:%p",
            proxy.host, proxy.port
        ),
        _ => format!("nc -X connect -x {}:{} %h %p", proxy.host, proxy.port),
    }
}

/// Map an ssh client failure onto the retry taxonomy.
fn classify(host: &str, operation: &'static str, stderr: &str) -> RemoteError {
    if HOST_KEY_MARKERS.iter().any(|m| stderr.contains(m)) {
        return RemoteError::HostKeyChanged {
            host: host.to_string(),
        };
    }

    if let Some(line) = stderr
        .lines()
        .find(|line| UNREACHABLE_MARKERS.iter().any(|m| line.contains(m)))
    {
        return RemoteError::Unreachable {
            host: host.to_string(),
            reason: line.trim().to_string(),
        };
    }

    RemoteError::Failed {
        host: host.to_string(),
        operation,
        message: stderr.trim().to_string(),
    }
}
