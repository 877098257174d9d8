//! Idempotent get-or-create of the cluster security group.
//!
//! The group is a process-wide singleton per name, reused by every cluster
//! in the account and region. A group created without its rules (a failure
//! between create and authorize) is left as is; launches into it fail
//! visibly on SSH.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::provider::{
    ComputeProvider, IngressRule, IngressSource, IpProtocol, ProviderError, SecurityGroupInfo,
};

const GROUP_DESCRIPTION: &str =
    "Allow SSH, HTTP and HTTPS from anywhere and all TCP within the group";

/// Security group errors.
#[derive(Debug, Error)]
pub enum SecurityGroupError {
    #[error("describe_security_groups: {count} groups named {name}, expected at most one")]
    Duplicate { name: String, count: usize },

    #[error("create_security_group: {name} not visible after creation")]
    NotFoundAfterCreate { name: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Ingress rules applied to a newly created group.
pub fn default_ingress_rules() -> Vec<IngressRule> {
    let anywhere = || IngressSource::Cidr("0.0.0.0/0".to_string());
    let tcp = |port: i32| IngressRule {
        protocol: IpProtocol::Tcp,
        from_port: port,
        to_port: port,
        source: anywhere(),
    };

    vec![
        tcp(22),
        tcp(80),
        tcp(443),
        IngressRule {
            protocol: IpProtocol::Icmp,
            from_port: -1,
            to_port: -1,
            source: anywhere(),
        },
        IngressRule {
            protocol: IpProtocol::Tcp,
            from_port: 0,
            to_port: 65535,
            source: IngressSource::SameGroup,
        },
    ]
}

/// Get-or-create for the cluster security group.
pub struct SecurityGroupManager {
    provider: Arc<dyn ComputeProvider>,
}

impl SecurityGroupManager {
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self { provider }
    }

    /// Return the id of the group named `name`, creating it first if needed.
    pub async fn ensure_group(&self, name: &str) -> Result<String, SecurityGroupError> {
        if let Some(group) = self.find(name).await? {
            debug!(group_id = %group.id, name, "Reusing security group");
            return Ok(group.id);
        }

        info!(name, "Creating security group");
        self.provider
            .create_security_group(name, GROUP_DESCRIPTION)
            .await?;

        let group = self
            .find(name)
            .await?
            .ok_or_else(|| SecurityGroupError::NotFoundAfterCreate {
                name: name.to_string(),
            })?;

        self.provider
            .authorize_ingress(&group.id, &default_ingress_rules())
            .await?;

        info!(group_id = %group.id, name, "Security group ready");
        Ok(group.id)
    }

    async fn find(&self, name: &str) -> Result<Option<SecurityGroupInfo>, SecurityGroupError> {
        let mut groups = self.provider.describe_security_groups(name).await?;
        match groups.len() {
            0 => Ok(None),
            1 => Ok(groups.pop()),
            count => Err(SecurityGroupError::Duplicate {
                name: name.to_string(),
                count,
            }),
        }
    }
}
