//! Configuration for the provisioner.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use osc_catalog::{SchemaTag, Version};
use osc_retry::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};

/// Security group shared by every cluster in an account and region.
pub const DEFAULT_SECURITY_GROUP: &str = "openstudio-server-sg-v2.2";

/// What to do with a just-launched instance when its launch fails after
/// submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Leave the resource running and report its id.
    #[default]
    LeaveAndReport,
    /// Terminate the instance before reporting.
    Terminate,
}

impl FromStr for TimeoutPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leave" | "leave-and-report" => Ok(Self::LeaveAndReport),
            "terminate" => Ok(Self::Terminate),
            other => Err(anyhow!("unknown timeout policy: {other}")),
        }
    }
}

/// HTTP proxy for remote-shell sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Security group name.
    pub security_group_name: String,

    /// Value of the `UserID` tag.
    pub user_id: String,

    /// Login user on the cluster images.
    pub ssh_user: String,

    /// Hostname the server boot script assigns.
    pub server_hostname: String,

    /// Directory for key files and summaries.
    pub key_dir: PathBuf,

    /// Optional HTTP proxy for remote-shell sessions.
    pub proxy: Option<ProxyConfig>,

    /// Interval between instance and volume status polls.
    pub poll_interval: Duration,

    /// Bound on instance and volume status polls.
    pub poll_timeout: Duration,

    /// Interval between boot-marker checks.
    pub ready_poll_interval: Duration,

    /// Cleanup behavior on launch failure.
    pub timeout_policy: TimeoutPolicy,

    /// Image owner account for catalog listings.
    pub ami_owner: Option<String>,

    /// Catalog schema to publish.
    pub catalog_schema: SchemaTag,

    /// Versions up to this one never inherit a stable build.
    pub stable_baseline: Option<Version>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            security_group_name: DEFAULT_SECURITY_GROUP.to_string(),
            user_id: "unknown_user".to_string(),
            ssh_user: "ubuntu".to_string(),
            server_hostname: "master".to_string(),
            key_dir: default_key_dir(),
            proxy: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            ready_poll_interval: DEFAULT_POLL_INTERVAL,
            timeout_policy: TimeoutPolicy::default(),
            ami_owner: None,
            catalog_schema: SchemaTag::V1,
            stable_baseline: None,
            log_level: "info".to_string(),
        }
    }
}

fn default_key_dir() -> PathBuf {
    ProjectDirs::from("org", "openstudio", "osc")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let security_group_name = lookup("OSC_SECURITY_GROUP")
            .unwrap_or(defaults.security_group_name);

        // USER is the login of whoever runs the tool
        let user_id = lookup("OSC_USER_ID")
            .or_else(|| lookup("USER"))
            .unwrap_or(defaults.user_id);

        let ssh_user = lookup("OSC_SSH_USER").unwrap_or(defaults.ssh_user);
        let server_hostname = lookup("OSC_SERVER_HOSTNAME").unwrap_or(defaults.server_hostname);
        let key_dir = lookup("OSC_KEY_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.key_dir);

        let proxy = match lookup("OSC_PROXY_HOST") {
            Some(host) => Some(ProxyConfig {
                host,
                port: parse_var(&lookup, "OSC_PROXY_PORT")?.unwrap_or(8080),
                username: lookup("OSC_PROXY_USER"),
                password: lookup("OSC_PROXY_PASSWORD"),
            }),
            None => None,
        };

        let poll_interval = parse_var(&lookup, "OSC_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);
        let poll_timeout = parse_var(&lookup, "OSC_POLL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout);
        let ready_poll_interval = parse_var(&lookup, "OSC_READY_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.ready_poll_interval);

        let timeout_policy = parse_var(&lookup, "OSC_TIMEOUT_POLICY")?
            .unwrap_or(defaults.timeout_policy);

        let catalog_schema = match lookup("OSC_CATALOG_SCHEMA").as_deref() {
            None | Some("v1") => SchemaTag::V1,
            Some("v2") => SchemaTag::V2,
            Some(other) => return Err(anyhow!("OSC_CATALOG_SCHEMA: unknown schema {other}")),
        };
        let stable_baseline = parse_var(&lookup, "OSC_STABLE_BASELINE")?;

        let log_level = lookup("OSC_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            security_group_name,
            user_id,
            ssh_user,
            server_hostname,
            key_dir,
            proxy,
            poll_interval,
            poll_timeout,
            ready_poll_interval,
            timeout_policy,
            ami_owner: lookup("OSC_AMI_OWNER"),
            catalog_schema,
            stable_baseline,
            log_level,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("{e}"))
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}
