//! Cluster lifecycle orchestration.
//!
//! A [`ClusterOrchestrator`] drives one cluster (a server plus N workers
//! sharing a `GroupUUID` tag) through explicit method calls:
//!
//! ```text
//! uninitialized -> security_ready -> keys_ready -> server_launching
//!   -> server_running -> workers_launching -> workers_running
//!   -> configuring -> configured
//! ```
//!
//! State lives only in memory. Provider tags are the source of truth for
//! whether a cluster exists, so [`ClusterOrchestrator::find_cluster`] can
//! rebuild the node records of an earlier run without launching anything.
//!
//! Nothing created here is rolled back on failure; errors name the
//! resource so it can be cleaned up by hand. A failed step leaves the
//! cluster in the state it was in before the step started.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::{
    generate_worker_keys, load_worker_keys, render_mongoid_config, render_roster, render_server_script,
    render_worker_script, write_json, write_scratch, ArtifactError, ServerSummary, WorkerKeys,
    WorkerSummary, SERVER_KEY_FILE, SERVER_SUMMARY_FILE, WORKER_PRIVATE_KEY_FILE,
    WORKER_PUBLIC_KEY_FILE, WORKER_SUMMARY_FILE,
};
use crate::config::Config;
use crate::error::{ClusterError, Result};
use crate::instance::{InstanceProvisioner, LaunchOptions, LaunchTimings};
use crate::key_pair::{
    default_key_pair_name, load_private_key, write_key_file, KeyPair, KeyPairError,
    KeyPairManager, PRIVATE_KEY_MODE, PUBLIC_KEY_MODE,
};
use crate::model::{Instance, Role, GROUP_UUID_TAG, PURPOSE_TAG};
use crate::provider::{ComputeProvider, InstanceDescription, InstanceFilter};
use crate::remote::{RemoteExecutor, RemoteShell, SshShell, Transfer};
use crate::security_group::SecurityGroupManager;

/// Prints `true` once the boot script has finished.
pub const BOOT_MARKER_CHECK: &str = "[ -e /home/ubuntu/user_data_done ] && echo 'true'";

/// Remote path of the roster file.
pub const REMOTE_ROSTER_PATH: &str = "/home/ubuntu/ip_addresses";

/// Remote path of the database connection config.
pub const REMOTE_MONGOID_PATH: &str = "/home/ubuntu/mongoid.yml";

const PERMISSIONS_COMMAND: &str = "chmod 664 /home/ubuntu/ip_addresses /home/ubuntu/mongoid.yml";

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterState {
    Uninitialized,
    SecurityReady,
    KeysReady,
    ServerLaunching,
    ServerRunning,
    WorkersLaunching,
    WorkersRunning,
    Configuring,
    Configured,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::SecurityReady => "security_ready",
            Self::KeysReady => "keys_ready",
            Self::ServerLaunching => "server_launching",
            Self::ServerRunning => "server_running",
            Self::WorkersLaunching => "workers_launching",
            Self::WorkersRunning => "workers_running",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch settings shared by the server and worker launches.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub subnet_id: Option<String>,
    pub associate_public_ip: bool,
    pub ebs_volume_size_gb: Option<u32>,
    pub availability_zone: Option<String>,
    /// Extra tags; reserved keys are rejected.
    pub tags: BTreeMap<String, String>,
}

/// An upload that was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedTransfer {
    pub host: String,
    pub remote_path: String,
}

/// Outcome of [`ClusterOrchestrator::configure_cluster`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub nodes: usize,
    pub abandoned: Vec<AbandonedTransfer>,
}

/// Drives one cluster through its lifecycle.
pub struct ClusterOrchestrator {
    provider: Arc<dyn ComputeProvider>,
    config: Config,
    provisioner: InstanceProvisioner,
    group_uuid: String,
    state: ClusterState,
    security_group_id: Option<String>,
    key_pair: Option<KeyPair>,
    worker_keys: Option<WorkerKeys>,
    remote_shell: Option<Arc<dyn RemoteShell>>,
    server: Option<Instance>,
    workers: Vec<Instance>,
}

impl ClusterOrchestrator {
    /// Create an orchestrator for a new cluster with a fresh group id.
    pub fn new(provider: Arc<dyn ComputeProvider>, config: Config) -> Self {
        let provisioner = InstanceProvisioner::new(
            provider.clone(),
            LaunchTimings::from_config(&config),
            config.timeout_policy,
        );
        Self {
            provider,
            config,
            provisioner,
            group_uuid: Uuid::new_v4().simple().to_string(),
            state: ClusterState::Uninitialized,
            security_group_id: None,
            key_pair: None,
            worker_keys: None,
            remote_shell: None,
            server: None,
            workers: Vec::new(),
        }
    }

    pub fn with_group_uuid(mut self, group_uuid: &str) -> Self {
        self.group_uuid = group_uuid.to_string();
        self
    }

    /// Use `shell` for remote sessions instead of the system ssh client.
    pub fn with_remote_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.remote_shell = Some(shell);
        self
    }

    /// Use an existing worker keypair instead of generating one.
    pub fn with_worker_keys(mut self, keys: WorkerKeys) -> Self {
        self.worker_keys = Some(keys);
        self
    }

    pub fn group_uuid(&self) -> &str {
        &self.group_uuid
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn security_group_id(&self) -> Option<&str> {
        self.security_group_id.as_deref()
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }

    pub fn server(&self) -> Option<&Instance> {
        self.server.as_ref()
    }

    pub fn workers(&self) -> &[Instance] {
        &self.workers
    }

    fn invalid(&self, operation: &'static str, required: &'static str) -> ClusterError {
        ClusterError::InvalidState {
            operation,
            state: self.state,
            required,
        }
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    /// Get or create the shared security group.
    pub async fn setup_security_group(&mut self) -> Result<String> {
        let manager = SecurityGroupManager::new(self.provider.clone());
        let group_id = manager
            .ensure_group(&self.config.security_group_name)
            .await?;

        self.security_group_id = Some(group_id.clone());
        if self.state == ClusterState::Uninitialized {
            self.state = ClusterState::SecurityReady;
        }
        Ok(group_id)
    }

    /// Get or create the cluster key pair.
    pub async fn setup_key_pair(&mut self, name: Option<&str>) -> Result<&KeyPair> {
        if self.state != ClusterState::SecurityReady {
            return Err(self.invalid("setup_key_pair", "security_ready"));
        }

        let manager = KeyPairManager::new(self.provider.clone());
        let key_pair = manager.ensure_key_pair(name, &self.group_uuid).await?;
        self.state = ClusterState::KeysReady;
        Ok(self.key_pair.insert(key_pair))
    }

    /// Security group then key pair.
    pub async fn setup(&mut self, key_pair_name: Option<&str>) -> Result<()> {
        self.setup_security_group().await?;
        self.setup_key_pair(key_pair_name).await?;
        Ok(())
    }

    /// Use a local key file for the cluster key pair, for clusters whose
    /// pair was created by an earlier run.
    pub fn attach_private_key(&mut self, name: Option<&str>, path: &Path) -> Result<()> {
        let (resolved, material) = load_private_key(path)?;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| default_key_pair_name(&self.group_uuid));

        info!(key_pair = %name, path = %resolved.display(), "Attached private key");
        self.key_pair = Some(
            KeyPair {
                name,
                private_key_material: None,
                local_file_path: None,
            }
            .with_key_file(resolved, material),
        );
        if self.state == ClusterState::SecurityReady {
            self.state = ClusterState::KeysReady;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Launch
    // -------------------------------------------------------------------------

    fn launch_options(
        &self,
        operation: &'static str,
        role: Role,
        options: &NodeOptions,
    ) -> Result<LaunchOptions> {
        let (Some(security_group_id), Some(key_pair)) = (&self.security_group_id, &self.key_pair)
        else {
            return Err(self.invalid(operation, "a security group and key pair"));
        };

        let mut launch = LaunchOptions::new(
            role,
            &self.group_uuid,
            &self.config.user_id,
            &key_pair.name,
        );
        launch.security_group_ids = vec![security_group_id.clone()];
        launch.subnet_id = options.subnet_id.clone();
        launch.associate_public_ip = options.associate_public_ip;
        launch.ebs_volume_size_gb = options.ebs_volume_size_gb;
        launch.availability_zone = options.availability_zone.clone();
        Ok(launch)
    }

    /// Launch the server and wait for it to run.
    pub async fn launch_server(
        &mut self,
        image_id: &str,
        instance_type: &str,
        options: &NodeOptions,
    ) -> Result<&Instance> {
        if self.state != ClusterState::KeysReady {
            return Err(self.invalid("launch_server", "keys_ready"));
        }
        let launch = self.launch_options("launch_server", Role::Server, options)?;

        let keys = match self.worker_keys.clone() {
            Some(keys) => keys,
            None => {
                let keys = generate_worker_keys().await?;
                self.worker_keys = Some(keys.clone());
                keys
            }
        };
        let user_data = render_server_script(&self.config.server_hostname, &keys);

        info!(group_uuid = %self.group_uuid, image_id, instance_type, "Launching server");
        self.state = ClusterState::ServerLaunching;
        let result = self
            .provisioner
            .launch(image_id, instance_type, &user_data, &options.tags, &launch)
            .await;

        match result {
            Ok(server) => {
                self.state = ClusterState::ServerRunning;
                Ok(self.server.insert(server))
            }
            Err(e) => {
                self.state = ClusterState::KeysReady;
                Err(e.into())
            }
        }
    }

    /// Launch `count` workers concurrently and wait for all of them.
    ///
    /// Every launch runs to completion even when a sibling fails; the
    /// successful ones are kept and the first failure is returned.
    pub async fn launch_workers(
        &mut self,
        image_id: &str,
        instance_type: &str,
        count: usize,
        options: &NodeOptions,
    ) -> Result<&[Instance]> {
        if !matches!(
            self.state,
            ClusterState::ServerRunning | ClusterState::WorkersRunning | ClusterState::Configured
        ) {
            return Err(self.invalid("launch_workers", "server_running"));
        }
        let launch = self.launch_options("launch_workers", Role::Worker, options)?;
        let server_ip = self
            .server
            .as_ref()
            .and_then(|s| s.private_ip.clone())
            .ok_or_else(|| self.invalid("launch_workers", "a server private ip"))?;
        let keys = self
            .worker_keys
            .as_ref()
            .ok_or_else(|| self.invalid("launch_workers", "the worker keypair"))?;
        let user_data = render_worker_script(&self.config.server_hostname, &server_ip, keys);

        info!(
            group_uuid = %self.group_uuid,
            count,
            image_id,
            instance_type,
            "Launching workers"
        );
        let previous = self.state;
        self.state = ClusterState::WorkersLaunching;

        let handles: Vec<_> = (0..count)
            .map(|_| {
                let provisioner = self.provisioner.clone();
                let image_id = image_id.to_string();
                let instance_type = instance_type.to_string();
                let user_data = user_data.clone();
                let tags = options.tags.clone();
                let launch = launch.clone();
                tokio::spawn(async move {
                    provisioner
                        .launch(&image_id, &instance_type, &user_data, &tags, &launch)
                        .await
                })
            })
            .collect();

        let mut first_error: Option<ClusterError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(worker)) => self.workers.push(worker),
                Ok(Err(e)) => {
                    warn!(error = %e, "Worker launch failed");
                    first_error.get_or_insert(e.into());
                }
                Err(e) => {
                    first_error.get_or_insert(ClusterError::WorkerTask {
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(e) = first_error {
            self.state = previous;
            return Err(e);
        }

        self.state = ClusterState::WorkersRunning;
        info!(group_uuid = %self.group_uuid, workers = self.workers.len(), "Workers running");
        Ok(&self.workers)
    }

    // -------------------------------------------------------------------------
    // Configure
    // -------------------------------------------------------------------------

    /// Path of the cluster private key on disk.
    ///
    /// A created pair is written into the key dir as `<key pair name>.pem`
    /// on first use, and the path is recorded so [`Self::delete_key_pair`]
    /// removes it again.
    pub fn private_key_file(&mut self) -> Result<PathBuf> {
        let state = self.state;
        let key_pair = self.key_pair.as_mut().ok_or(ClusterError::InvalidState {
            operation: "private_key_file",
            state,
            required: "a key pair",
        })?;
        if let Some(path) = &key_pair.local_file_path {
            return Ok(path.clone());
        }

        let path = self.config.key_dir.join(format!("{}.pem", key_pair.name));
        write_key_file(&path, key_pair.private_key()?, PRIVATE_KEY_MODE)?;
        info!(key_pair = %key_pair.name, path = %path.display(), "Wrote private key");
        key_pair.local_file_path = Some(path.clone());
        Ok(path)
    }

    fn remote_executor(&mut self, operation: &'static str) -> Result<RemoteExecutor> {
        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or_else(|| self.invalid(operation, "a key pair"))?;
        key_pair.private_key()?;

        if let Some(shell) = &self.remote_shell {
            return Ok(RemoteExecutor::new(shell.clone()));
        }

        let key_path = self.private_key_file()?;
        let shell = SshShell::new(&self.config.ssh_user, key_path)
            .with_proxy(self.config.proxy.clone());
        Ok(RemoteExecutor::new(Arc::new(shell)))
    }

    /// Wait for every node to finish booting, then upload the roster and
    /// database config to each and fix their permissions.
    ///
    /// Nodes are handled one at a time, server first. On failure the
    /// cluster returns to the state it had before the call.
    pub async fn configure_cluster(&mut self) -> Result<ConfigureReport> {
        let server = match (&self.server, self.state >= ClusterState::ServerRunning) {
            (Some(server), true) => server.clone(),
            _ => return Err(self.invalid("configure_cluster", "server_running")),
        };
        let executor = self.remote_executor("configure_cluster")?;

        let previous = self.state;
        self.state = ClusterState::Configuring;
        info!(
            group_uuid = %self.group_uuid,
            nodes = self.workers.len() + 1,
            "Configuring cluster"
        );

        match self.configure_nodes(&executor, &server).await {
            Ok(report) => {
                self.state = ClusterState::Configured;
                info!(
                    group_uuid = %self.group_uuid,
                    abandoned = report.abandoned.len(),
                    "Cluster configured"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(group_uuid = %self.group_uuid, error = %e, "Configuration failed");
                self.state = previous;
                Err(e)
            }
        }
    }

    async fn configure_nodes(
        &self,
        executor: &RemoteExecutor,
        server: &Instance,
    ) -> Result<ConfigureReport> {
        let nodes = std::iter::once(server)
            .chain(&self.workers)
            .map(|node| {
                node.ssh_host().ok_or_else(|| ClusterError::NoAddress {
                    instance_id: node.provider_id.clone(),
                })
            })
            .collect::<Result<Vec<&str>>>()?;

        let interval = self.config.ready_poll_interval;
        for host in &nodes {
            executor
                .wait_until_true(host, BOOT_MARKER_CHECK, interval)
                .await?;
        }

        let scratch = TempDir::new().map_err(|source| ArtifactError::Io {
            operation: "create temp dir",
            path: std::env::temp_dir(),
            source,
        })?;
        let roster = write_scratch(
            scratch.path(),
            "ip_addresses",
            &render_roster(server, &self.workers, &self.config.ssh_user),
        )?;
        let mongoid = write_scratch(
            scratch.path(),
            "mongoid.yml",
            &render_mongoid_config(server.private_ip.as_deref().unwrap_or_default()),
        )?;

        let mut report = ConfigureReport {
            nodes: nodes.len(),
            abandoned: Vec::new(),
        };
        for host in nodes {
            let uploads = [(&roster, REMOTE_ROSTER_PATH), (&mongoid, REMOTE_MONGOID_PATH)];
            for (local, remote) in uploads {
                if let Transfer::Abandoned { .. } = executor.upload(host, local, remote).await? {
                    report.abandoned.push(AbandonedTransfer {
                        host: host.to_string(),
                        remote_path: remote.to_string(),
                    });
                }
            }
            executor.run(host, PERMISSIONS_COMMAND).await?;
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    async fn describe_group(
        &self,
        group_uuid: &str,
        role: Role,
    ) -> Result<Vec<InstanceDescription>> {
        let filter = InstanceFilter::default()
            .with_tag(GROUP_UUID_TAG, group_uuid)
            .with_tag(PURPOSE_TAG, role.purpose())
            .live();
        Ok(self.provider.describe_instances(&filter).await?)
    }

    /// Rebuild the node records of an existing cluster from provider tags.
    pub async fn find_cluster(&mut self, group_uuid: &str) -> Result<()> {
        let mut servers = self.describe_group(group_uuid, Role::Server).await?;
        let server = match servers.len() {
            0 => {
                return Err(ClusterError::ServerNotFound {
                    group_uuid: group_uuid.to_string(),
                })
            }
            1 => servers.remove(0),
            _ => {
                let mut instance_ids: Vec<String> =
                    servers.into_iter().map(|d| d.instance_id).collect();
                instance_ids.sort();
                return Err(ClusterError::MultipleServers {
                    group_uuid: group_uuid.to_string(),
                    instance_ids,
                });
            }
        };

        let mut workers = self.describe_group(group_uuid, Role::Worker).await?;
        workers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        self.group_uuid = group_uuid.to_string();
        self.server = Some(Instance::from_description(&server, Role::Server));
        self.workers = workers
            .iter()
            .map(|d| Instance::from_description(d, Role::Worker))
            .collect();
        self.state = if self.workers.is_empty() {
            ClusterState::ServerRunning
        } else {
            ClusterState::WorkersRunning
        };

        info!(
            group_uuid,
            server = %server.instance_id,
            workers = self.workers.len(),
            "Found existing cluster"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Teardown and account queries
    // -------------------------------------------------------------------------

    /// Terminate every live instance tagged with this cluster's group id.
    pub async fn terminate(&mut self) -> Result<Vec<String>> {
        let filter = InstanceFilter::default()
            .with_tag(GROUP_UUID_TAG, &self.group_uuid)
            .live();
        let mut instance_ids: Vec<String> = self
            .provider
            .describe_instances(&filter)
            .await?
            .into_iter()
            .map(|d| d.instance_id)
            .collect();
        instance_ids.sort();

        if !instance_ids.is_empty() {
            self.provider.terminate_instances(&instance_ids).await?;
        }
        info!(group_uuid = %self.group_uuid, count = instance_ids.len(), "Terminated cluster");

        self.server = None;
        self.workers.clear();
        self.state = match (&self.security_group_id, &self.key_pair) {
            (Some(_), Some(_)) => ClusterState::KeysReady,
            (Some(_), None) => ClusterState::SecurityReady,
            _ => ClusterState::Uninitialized,
        };
        Ok(instance_ids)
    }

    /// Delete the provider-side key pair, and its local file when this
    /// orchestrator wrote it.
    pub async fn delete_key_pair(&mut self) -> Result<()> {
        let Some(key_pair) = self.key_pair.take() else {
            return Ok(());
        };

        KeyPairManager::new(self.provider.clone())
            .delete_key_pair(&key_pair.name)
            .await?;

        if let Some(path) = key_pair
            .local_file_path
            .filter(|p| p.starts_with(&self.config.key_dir))
        {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(KeyPairError::Io {
                        operation: "remove",
                        path,
                        source,
                    }
                    .into())
                }
            }
        }

        if self.state == ClusterState::KeysReady {
            self.state = ClusterState::SecurityReady;
        }
        Ok(())
    }

    pub async fn describe_availability_zones(&self) -> Result<Vec<String>> {
        Ok(self.provider.describe_availability_zones().await?)
    }

    /// Live instances, optionally narrowed to one group and role.
    pub async fn describe_running_instances(
        &self,
        group_uuid: Option<&str>,
        role: Option<Role>,
    ) -> Result<Vec<InstanceDescription>> {
        let mut filter = InstanceFilter::default().live();
        if let Some(group_uuid) = group_uuid {
            filter = filter.with_tag(GROUP_UUID_TAG, group_uuid);
        }
        if let Some(role) = role {
            filter = filter.with_tag(PURPOSE_TAG, role.purpose());
        }
        Ok(self.provider.describe_instances(&filter).await?)
    }

    /// Live instances across the whole account.
    pub async fn total_instance_count(&self) -> Result<usize> {
        Ok(self.describe_running_instances(None, None).await?.len())
    }

    pub async fn estimated_charges(&self) -> Result<Option<f64>> {
        Ok(self.provider.estimated_charges().await?)
    }

    // -------------------------------------------------------------------------
    // Local artifacts
    // -------------------------------------------------------------------------

    fn summary_for(&self, key_dir: &Path) -> Result<ServerSummary> {
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| self.invalid("server_summary", "a server"))?;
        Ok(ServerSummary::new(&self.group_uuid, server, key_dir, Utc::now()))
    }

    /// Summary of the server, naming key files in the configured key dir.
    pub fn server_summary(&self) -> Result<ServerSummary> {
        self.summary_for(&self.config.key_dir)
    }

    pub fn worker_summaries(&self) -> Vec<WorkerSummary> {
        self.workers.iter().map(WorkerSummary::from).collect()
    }

    /// Write the server and worker summaries into `dir`.
    pub fn save_summaries(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let summary = self.summary_for(dir)?;
        create_dir(dir)?;

        let server_path = dir.join(SERVER_SUMMARY_FILE);
        let worker_path = dir.join(WORKER_SUMMARY_FILE);
        write_json(&server_path, &summary)?;
        write_json(&worker_path, &self.worker_summaries())?;
        Ok((server_path, worker_path))
    }

    /// Write the cluster private key and the worker keypair into `dir`.
    pub fn save_private_keys(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        let key_pair = self
            .key_pair
            .as_mut()
            .ok_or(ClusterError::InvalidState {
                operation: "save_private_keys",
                state: self.state,
                required: "a key pair",
            })?;
        let material = key_pair.private_key()?.to_string();
        create_dir(dir)?;

        let server_key = dir.join(SERVER_KEY_FILE);
        write_key_file(&server_key, &material, PRIVATE_KEY_MODE)?;
        if key_pair.local_file_path.is_none() {
            key_pair.local_file_path = Some(server_key.clone());
        }
        let mut written = vec![server_key];

        if let Some(keys) = &self.worker_keys {
            let private = dir.join(WORKER_PRIVATE_KEY_FILE);
            let public = dir.join(WORKER_PUBLIC_KEY_FILE);
            write_key_file(&private, &keys.private_key, PRIVATE_KEY_MODE)?;
            write_key_file(&public, &keys.public_key, PUBLIC_KEY_MODE)?;
            written.push(private);
            written.push(public);
        }

        info!(dir = %dir.display(), files = written.len(), "Saved key files");
        Ok(written)
    }

    /// Read the worker keypair written by [`Self::save_private_keys`], so a
    /// cluster rebuilt with [`Self::find_cluster`] can launch more workers.
    pub fn load_worker_keys(&mut self, dir: &Path) -> Result<&WorkerKeys> {
        let keys = load_worker_keys(dir)?;
        info!(dir = %dir.display(), "Loaded worker keypair");
        Ok(self.worker_keys.insert(keys))
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| {
        ArtifactError::Io {
            operation: "create_dir",
            path: dir.to_path_buf(),
            source,
        }
        .into()
    })
}
