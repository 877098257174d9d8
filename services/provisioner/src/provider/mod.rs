//! Compute provider contract.
//!
//! The orchestrator never talks to a cloud SDK directly. Everything it needs
//! from the provider goes through [`ComputeProvider`]:
//! - Security group describe/create/authorize
//! - Key pair describe/create/delete
//! - Instance run/tag/describe/terminate
//! - Volume create/describe/attach
//! - Image listing, availability zones, billing metric
//!
//! Describe calls filter by exact name, tag key/value and id list. The
//! client is shared across concurrent launches as `Arc<dyn ComputeProvider>`
//! with no client-side locking.

mod mock;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockProvider;
pub use osc_catalog::ProviderImage;

/// Errors returned by the provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The instance id is not (yet) visible to this API.
    #[error("{operation}: instance {instance_id} not found")]
    InstanceNotFound {
        operation: &'static str,
        instance_id: String,
    },

    /// Any other resource was not found.
    #[error("{operation}: {resource} not found")]
    NotFound {
        operation: &'static str,
        resource: String,
    },

    /// The provider rejected or failed the request.
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl ProviderError {
    /// Returns true for the launch/tag consistency race.
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. })
    }
}

/// IP protocol of an ingress rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpProtocol {
    Tcp,
    Icmp,
}

/// Where ingress traffic may come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressSource {
    Cidr(String),
    /// Members of the group the rule belongs to.
    SameGroup,
}

/// One ingress permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: IpProtocol,
    /// Port range; `-1..-1` means every ICMP type.
    pub from_port: i32,
    pub to_port: i32,
    pub source: IngressSource,
}

/// A security group as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupInfo {
    pub id: String,
    pub name: String,
    pub ingress_rules: Vec<IngressRule>,
}

/// A key pair as described by the provider. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairInfo {
    pub name: String,
    pub fingerprint: Option<String>,
}

/// A key pair returned by creation, the only time material is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedKeyPair {
    pub name: String,
    pub private_key_material: String,
}

/// Network interface block for launches that need a public IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    pub device_index: u32,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub associate_public_ip_address: bool,
}

/// A request to launch exactly one instance.
///
/// Security groups and subnet live either at the top level or inside
/// `network_interfaces`, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub user_data: String,
    pub key_name: String,
    pub min_count: u32,
    pub max_count: u32,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub availability_zone: Option<String>,
}

/// Provider-side instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub instance_type: String,
    pub image_id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub public_dns: Option<String>,
    pub availability_zone: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

/// Instance describe filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub instance_ids: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub states: Vec<InstanceState>,
}

impl InstanceFilter {
    /// Filter on a single instance id.
    pub fn by_id(instance_id: &str) -> Self {
        Self {
            instance_ids: vec![instance_id.to_string()],
            ..Self::default()
        }
    }

    /// Add a tag key/value condition.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Restrict to live instances (pending or running).
    pub fn live(mut self) -> Self {
        self.states = vec![InstanceState::Pending, InstanceState::Running];
        self
    }

    /// Check whether an instance satisfies this filter.
    pub fn matches(&self, instance: &InstanceDescription) -> bool {
        (self.instance_ids.is_empty() || self.instance_ids.contains(&instance.instance_id))
            && (self.states.is_empty() || self.states.contains(&instance.state))
            && self
                .tags
                .iter()
                .all(|(k, v)| instance.tags.get(k) == Some(v))
    }
}

/// Provider-side volume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Error,
}

/// A block volume as described by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub state: VolumeState,
    pub size_gb: u32,
    pub availability_zone: String,
}

/// The provider API the orchestrator depends on.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Security groups whose name equals `name` exactly.
    async fn describe_security_groups(
        &self,
        name: &str,
    ) -> Result<Vec<SecurityGroupInfo>, ProviderError>;

    async fn create_security_group(&self, name: &str, description: &str)
        -> Result<(), ProviderError>;

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError>;

    /// Key pairs whose name equals `name` exactly.
    async fn describe_key_pairs(&self, name: &str) -> Result<Vec<KeyPairInfo>, ProviderError>;

    async fn create_key_pair(&self, name: &str) -> Result<CreatedKeyPair, ProviderError>;

    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError>;

    /// Launch one instance and return its id.
    async fn run_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError>;

    async fn create_tags(
        &self,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    async fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceDescription>, ProviderError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    async fn create_volume(
        &self,
        availability_zone: &str,
        size_gb: u32,
    ) -> Result<String, ProviderError>;

    async fn describe_volume(&self, volume_id: &str) -> Result<VolumeDescription, ProviderError>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), ProviderError>;

    /// Delete a volume that is not attached.
    async fn delete_volume(&self, volume_id: &str) -> Result<(), ProviderError>;

    async fn describe_availability_zones(&self) -> Result<Vec<String>, ProviderError>;

    /// Machine images, optionally restricted to one owner account.
    async fn describe_images(&self, owner: Option<&str>)
        -> Result<Vec<ProviderImage>, ProviderError>;

    /// Latest estimated charges for the account, if the metric exists.
    async fn estimated_charges(&self) -> Result<Option<f64>, ProviderError>;
}
