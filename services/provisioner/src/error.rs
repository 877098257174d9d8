//! Cluster-level errors.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::cluster::ClusterState;
use crate::instance::LaunchError;
use crate::key_pair::KeyPairError;
use crate::provider::ProviderError;
use crate::remote::RemoteError;
use crate::security_group::SecurityGroupError;

/// Errors raised by [`crate::ClusterOrchestrator`].
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{operation}: cluster is {state}, needs {required}")]
    InvalidState {
        operation: &'static str,
        state: ClusterState,
        required: &'static str,
    },

    #[error(
        "find_cluster: group {group_uuid} has {} server instances: {}",
        instance_ids.len(),
        instance_ids.join(", ")
    )]
    MultipleServers {
        group_uuid: String,
        instance_ids: Vec<String>,
    },

    #[error("find_cluster: no running server in group {group_uuid}")]
    ServerNotFound { group_uuid: String },

    #[error("configure_cluster: instance {instance_id} has no reachable address")]
    NoAddress { instance_id: String },

    #[error("launch_workers: worker task failed: {message}")]
    WorkerTask { message: String },

    #[error(transparent)]
    SecurityGroup(#[from] SecurityGroupError),

    #[error(transparent)]
    KeyPair(#[from] KeyPairError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
