//! Cluster node records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::InstanceDescription;

/// Tag carrying the node purpose.
pub const PURPOSE_TAG: &str = "Purpose";

/// Tag correlating every node of one cluster.
pub const GROUP_UUID_TAG: &str = "GroupUUID";

/// Tag keys the provisioner writes itself. Callers may not supply them.
pub const RESERVED_TAGS: [&str; 5] = [
    "Name",
    GROUP_UUID_TAG,
    "NumberOfProcessors",
    PURPOSE_TAG,
    "UserID",
];

/// Cores kept back on the server for the coordinator and database.
const SERVER_RESERVED_CORES: u32 = 2;

/// Physical cores per instance type.
const PROCESSOR_TABLE: &[(&str, u32)] = &[
    ("t2.micro", 1),
    ("t2.small", 1),
    ("t2.medium", 1),
    ("t2.large", 1),
    ("m3.medium", 1),
    ("m3.large", 1),
    ("m3.xlarge", 2),
    ("m3.2xlarge", 4),
    ("m4.large", 1),
    ("m4.xlarge", 2),
    ("m4.2xlarge", 4),
    ("m4.4xlarge", 8),
    ("m4.10xlarge", 20),
    ("m4.16xlarge", 32),
    ("c3.large", 1),
    ("c3.xlarge", 2),
    ("c3.2xlarge", 4),
    ("c3.4xlarge", 8),
    ("c3.8xlarge", 16),
    ("c4.large", 1),
    ("c4.xlarge", 2),
    ("c4.2xlarge", 4),
    ("c4.4xlarge", 8),
    ("c4.8xlarge", 18),
    ("r3.large", 1),
    ("r3.xlarge", 2),
    ("r3.2xlarge", 4),
    ("r3.4xlarge", 8),
    ("r3.8xlarge", 16),
    ("i2.xlarge", 2),
    ("i2.2xlarge", 4),
    ("i2.4xlarge", 8),
    ("i2.8xlarge", 16),
    ("cc2.8xlarge", 16),
];

/// Node role within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Worker,
}

impl Role {
    /// Value of the `Purpose` tag.
    pub fn purpose(&self) -> &'static str {
        match self {
            Self::Server => "OpenStudioServer",
            Self::Worker => "OpenStudioWorker",
        }
    }

    /// Role column of the roster file.
    pub fn roster_label(&self) -> &'static str {
        match self {
            Self::Server => "master",
            Self::Worker => "worker",
        }
    }

    /// Parse a `Purpose` tag value.
    pub fn from_purpose(purpose: &str) -> Option<Self> {
        match purpose {
            "OpenStudioServer" => Some(Self::Server),
            "OpenStudioWorker" => Some(Self::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Processor count for an instance type and role.
///
/// Unknown types count as one processor.
pub fn processor_count(instance_type: &str, role: Role) -> u32 {
    let cores = PROCESSOR_TABLE
        .iter()
        .find(|(name, _)| *name == instance_type)
        .map(|(_, cores)| *cores)
        .unwrap_or(1);

    match role {
        Role::Worker => cores,
        Role::Server => cores.saturating_sub(SERVER_RESERVED_CORES).max(1),
    }
}

/// Known instance types.
pub fn known_instance_types() -> impl Iterator<Item = (&'static str, u32)> {
    PROCESSOR_TABLE.iter().copied()
}

/// A launched or discovered cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub provider_id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub public_dns: Option<String>,
    pub instance_type: String,
    pub processor_count: u32,
    pub availability_zone: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub role: Role,
}

impl Instance {
    /// Build a node record from a provider description.
    pub fn from_description(description: &InstanceDescription, role: Role) -> Self {
        Self {
            provider_id: description.instance_id.clone(),
            public_ip: description.public_ip.clone(),
            private_ip: description.private_ip.clone(),
            public_dns: description.public_dns.clone(),
            instance_type: description.instance_type.clone(),
            processor_count: processor_count(&description.instance_type, role),
            availability_zone: description.availability_zone.clone(),
            launch_time: description.launch_time,
            role,
        }
    }

    /// Address to open remote-shell sessions against: public DNS, then
    /// public IP, then private IP. `None` when the node has no address.
    pub fn ssh_host(&self) -> Option<&str> {
        [&self.public_dns, &self.public_ip, &self.private_ip]
            .into_iter()
            .filter_map(|addr| addr.as_deref())
            .find(|addr| !addr.is_empty())
    }
}
