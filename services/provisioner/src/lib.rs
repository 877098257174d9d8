//! osc provisioner library
//!
//! Provisions and tears down a cluster of one server plus N workers on a
//! compute provider, and resolves which machine images to launch.
//!
//! ## Architecture
//!
//! ```text
//! ClusterOrchestrator
//! ├── SecurityGroupManager   (get-or-create of the shared group)
//! ├── KeyPairManager         (get-or-create of the cluster key pair)
//! ├── InstanceProvisioner    (launch, tag, poll, attach volume)
//! └── RemoteExecutor         (ssh commands and file transfer with retry)
//! ```
//!
//! Image selection lives in `osc-catalog`; [`catalog::fetch_catalog`]
//! feeds it a provider listing.
//!
//! ## Modules
//!
//! - `provider`: the compute provider contract and an in-memory provider
//! - `cluster`: lifecycle orchestration and discovery by tag
//! - `artifacts`: boot scripts, roster, summaries, worker keys

pub mod artifacts;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod instance;
pub mod key_pair;
pub mod model;
pub mod provider;
pub mod remote;
pub mod security_group;

pub use cluster::{ClusterOrchestrator, ClusterState, ConfigureReport, NodeOptions};
pub use config::{Config, ProxyConfig, TimeoutPolicy};
pub use error::ClusterError;
pub use instance::{InstanceProvisioner, LaunchError, LaunchOptions, LaunchTimings};
pub use key_pair::{KeyPair, KeyPairManager};
pub use model::{processor_count, Instance, Role};
pub use provider::{ComputeProvider, MockProvider};
pub use remote::{CommandOutput, RemoteError, RemoteExecutor, RemoteShell, SshShell, Transfer};
pub use security_group::SecurityGroupManager;
