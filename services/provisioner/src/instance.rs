//! Instance launch.
//!
//! A launch goes through these steps:
//! 1. Reject caller tags that collide with reserved keys
//! 2. Submit a single-instance launch request
//! 3. Tag the instance, retrying while the tag API cannot see it yet
//! 4. Poll until the instance is running
//! 5. Optionally create, await and attach a block volume
//! 6. Re-describe to capture addresses and launch time
//!
//! Failures after step 2 name the instance and leave it behind unless the
//! provisioner runs with [`TimeoutPolicy::Terminate`], which terminates it
//! and deletes any data volume created for it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use osc_retry::{poll_until, retry, PollError, RetryError, RetryPolicy};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TimeoutPolicy};
use crate::model::{
    processor_count, Instance, Role, GROUP_UUID_TAG, PURPOSE_TAG, RESERVED_TAGS,
};
use crate::provider::{
    ComputeProvider, InstanceFilter, InstanceState, LaunchRequest, NetworkInterfaceSpec,
    ProviderError, VolumeState,
};

/// Device the data volume is attached at.
pub const VOLUME_DEVICE: &str = "/dev/sdm";

/// Tagging attempts before a launch is abandoned.
pub const TAG_RETRY: RetryPolicy = RetryPolicy::bounded(3, Duration::from_secs(2));

/// Launch errors.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("run_instance: tag {key} is reserved")]
    ReservedTag { key: String },

    /// The launch request itself failed; nothing was created.
    #[error(transparent)]
    Provider(ProviderError),

    /// A provider call failed after the instance was created.
    #[error("instance {instance_id}: {source}")]
    AfterLaunch {
        instance_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("create_tags: instance {instance_id} still not taggable after {attempts} attempts")]
    Tagging {
        instance_id: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("wait_for_running: instance {instance_id} not running after {elapsed:?}")]
    InstanceTimeout {
        instance_id: String,
        elapsed: Duration,
    },

    #[error(
        "wait_for_volume: volume {volume_id} for instance {instance_id} not available after {elapsed:?}"
    )]
    VolumeTimeout {
        volume_id: String,
        instance_id: String,
        elapsed: Duration,
    },

    #[error("wait_for_volume: volume {volume_id} for instance {instance_id} entered error state")]
    VolumeFailed {
        volume_id: String,
        instance_id: String,
    },

    #[error("attach_volume: volume {volume_id} to instance {instance_id}: {source}")]
    VolumeAttach {
        volume_id: String,
        instance_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("describe_instances: instance {instance_id} disappeared after launch")]
    InstanceVanished { instance_id: String },
}

impl LaunchError {
    /// The instance this error concerns, when one was already launched.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::AfterLaunch { instance_id, .. }
            | Self::Tagging { instance_id, .. }
            | Self::InstanceTimeout { instance_id, .. }
            | Self::VolumeTimeout { instance_id, .. }
            | Self::VolumeFailed { instance_id, .. }
            | Self::VolumeAttach { instance_id, .. }
            | Self::InstanceVanished { instance_id } => Some(instance_id),
            Self::ReservedTag { .. } | Self::Provider(_) => None,
        }
    }
}

/// Per-launch settings.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub role: Role,
    pub group_uuid: String,
    pub user_id: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    /// Move security groups and subnet into a network interface with a
    /// public address.
    pub associate_public_ip: bool,
    /// Size of an extra data volume, if any.
    pub ebs_volume_size_gb: Option<u32>,
    pub availability_zone: Option<String>,
    /// Value of the `Name` tag; derived from role and group when unset.
    pub name: Option<String>,
}

impl LaunchOptions {
    pub fn new(role: Role, group_uuid: &str, user_id: &str, key_name: &str) -> Self {
        Self {
            role,
            group_uuid: group_uuid.to_string(),
            user_id: user_id.to_string(),
            key_name: key_name.to_string(),
            security_group_ids: Vec::new(),
            subnet_id: None,
            associate_public_ip: false,
            ebs_volume_size_gb: None,
            availability_zone: None,
            name: None,
        }
    }
}

/// Polling and retry settings for launches.
#[derive(Debug, Clone, Copy)]
pub struct LaunchTimings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub tag_retry: RetryPolicy,
}

impl LaunchTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            tag_retry: TAG_RETRY,
        }
    }
}

/// Launches single instances and waits for them to come up.
#[derive(Clone)]
pub struct InstanceProvisioner {
    provider: Arc<dyn ComputeProvider>,
    timings: LaunchTimings,
    timeout_policy: TimeoutPolicy,
}

impl InstanceProvisioner {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        timings: LaunchTimings,
        timeout_policy: TimeoutPolicy,
    ) -> Self {
        Self {
            provider,
            timings,
            timeout_policy,
        }
    }

    /// Launch one instance and return it once running.
    pub async fn launch(
        &self,
        image_id: &str,
        instance_type: &str,
        user_data: &str,
        custom_tags: &BTreeMap<String, String>,
        options: &LaunchOptions,
    ) -> Result<Instance, LaunchError> {
        if let Some(key) = RESERVED_TAGS
            .iter()
            .find(|reserved| custom_tags.contains_key(**reserved))
        {
            return Err(LaunchError::ReservedTag {
                key: key.to_string(),
            });
        }

        let request = build_request(image_id, instance_type, user_data, options);
        let instance_id = self
            .provider
            .run_instance(&request)
            .await
            .map_err(LaunchError::Provider)?;
        info!(
            instance_id = %instance_id,
            image_id,
            instance_type,
            role = %options.role,
            group_uuid = %options.group_uuid,
            "Launched instance"
        );

        let mut volume_id = None;
        match self
            .finish_launch(&instance_id, instance_type, custom_tags, options, &mut volume_id)
            .await
        {
            Ok(instance) => Ok(instance),
            Err(err) => {
                self.clean_up(&instance_id, volume_id.as_deref()).await;
                Err(err)
            }
        }
    }

    async fn finish_launch(
        &self,
        instance_id: &str,
        instance_type: &str,
        custom_tags: &BTreeMap<String, String>,
        options: &LaunchOptions,
        volume_id: &mut Option<String>,
    ) -> Result<Instance, LaunchError> {
        let tags = launch_tags(instance_type, custom_tags, options);
        self.tag(instance_id, &tags).await?;

        let availability_zone = self.wait_for_running(instance_id).await?;

        if let Some(size_gb) = options.ebs_volume_size_gb {
            self.attach_data_volume(instance_id, &availability_zone, size_gb, volume_id)
                .await?;
        }

        let description = self
            .provider
            .describe_instances(&InstanceFilter::by_id(instance_id))
            .await
            .map_err(after_launch(instance_id))?
            .into_iter()
            .next()
            .ok_or_else(|| LaunchError::InstanceVanished {
                instance_id: instance_id.to_string(),
            })?;

        let instance = Instance::from_description(&description, options.role);
        info!(
            instance_id,
            public_dns = instance.public_dns.as_deref().unwrap_or(""),
            private_ip = instance.private_ip.as_deref().unwrap_or(""),
            processors = instance.processor_count,
            "Instance running"
        );
        Ok(instance)
    }

    async fn tag(
        &self,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), LaunchError> {
        let provider = &self.provider;
        retry(
            &self.timings.tag_retry,
            "create_tags",
            |_| provider.create_tags(instance_id, tags),
            ProviderError::is_instance_not_found,
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { attempts, last, .. } => LaunchError::Tagging {
                instance_id: instance_id.to_string(),
                attempts,
                source: last,
            },
            RetryError::Fatal(e) => after_launch(instance_id)(e),
        })
    }

    /// Poll until running; returns the instance's availability zone.
    async fn wait_for_running(&self, instance_id: &str) -> Result<String, LaunchError> {
        let provider = &self.provider;
        let filter = &InstanceFilter::by_id(instance_id);

        poll_until(
            &format!("instance {instance_id}"),
            self.timings.poll_interval,
            self.timings.poll_timeout,
            move || async move {
                // Not yet visible counts as still pending
                let found = provider.describe_instances(filter).await?;
                Ok::<_, ProviderError>(found.into_iter().find_map(|d| {
                    debug!(instance_id = %d.instance_id, state = %d.state, "Instance status");
                    (d.state == InstanceState::Running).then_some(d.availability_zone)
                }))
            },
        )
        .await
        .map_err(|err| match err {
            PollError::Timeout { elapsed, .. } => LaunchError::InstanceTimeout {
                instance_id: instance_id.to_string(),
                elapsed,
            },
            PollError::Probe { error, .. } => after_launch(instance_id)(error),
        })
    }

    async fn attach_data_volume(
        &self,
        instance_id: &str,
        availability_zone: &str,
        size_gb: u32,
        created: &mut Option<String>,
    ) -> Result<(), LaunchError> {
        let volume_id = self
            .provider
            .create_volume(availability_zone, size_gb)
            .await
            .map_err(after_launch(instance_id))?;
        info!(volume_id = %volume_id, instance_id, size_gb, "Created volume");
        *created = Some(volume_id.clone());

        let provider = &self.provider;
        let volume = volume_id.as_str();
        poll_until(
            &format!("volume {volume_id}"),
            self.timings.poll_interval,
            self.timings.poll_timeout,
            move || async move {
                let described = provider
                    .describe_volume(volume)
                    .await
                    .map_err(after_launch(instance_id))?;
                match described.state {
                    VolumeState::Available => Ok(Some(())),
                    VolumeState::Error => Err(LaunchError::VolumeFailed {
                        volume_id: volume.to_string(),
                        instance_id: instance_id.to_string(),
                    }),
                    _ => Ok::<_, LaunchError>(None),
                }
            },
        )
        .await
        .map_err(|err| match err {
            PollError::Timeout { elapsed, .. } => LaunchError::VolumeTimeout {
                volume_id: volume_id.clone(),
                instance_id: instance_id.to_string(),
                elapsed,
            },
            PollError::Probe { error, .. } => error,
        })?;

        self.provider
            .attach_volume(&volume_id, instance_id, VOLUME_DEVICE)
            .await
            .map_err(|source| LaunchError::VolumeAttach {
                volume_id: volume_id.clone(),
                instance_id: instance_id.to_string(),
                source,
            })?;

        info!(volume_id = %volume_id, instance_id, device = VOLUME_DEVICE, "Attached volume");
        Ok(())
    }

    async fn clean_up(&self, instance_id: &str, volume_id: Option<&str>) {
        match self.timeout_policy {
            TimeoutPolicy::LeaveAndReport => {
                warn!(
                    instance_id,
                    volume_id = volume_id.unwrap_or(""),
                    "Launch failed; resources left in place for manual cleanup"
                );
            }
            TimeoutPolicy::Terminate => {
                warn!(instance_id, "Launch failed; terminating instance");
                if let Err(e) = self
                    .provider
                    .terminate_instances(&[instance_id.to_string()])
                    .await
                {
                    error!(instance_id, error = %e, "Failed to terminate instance");
                }
                // Termination releases an attached volume first
                if let Some(volume_id) = volume_id {
                    match self.provider.delete_volume(volume_id).await {
                        Ok(()) => info!(volume_id, instance_id, "Deleted volume"),
                        Err(e) => {
                            error!(volume_id, instance_id, error = %e, "Failed to delete volume")
                        }
                    }
                }
            }
        }
    }
}

/// Wraps a provider error raised once `instance_id` exists.
fn after_launch(instance_id: &str) -> impl Fn(ProviderError) -> LaunchError + '_ {
    move |source| LaunchError::AfterLaunch {
        instance_id: instance_id.to_string(),
        source,
    }
}

fn build_request(
    image_id: &str,
    instance_type: &str,
    user_data: &str,
    options: &LaunchOptions,
) -> LaunchRequest {
    let mut request = LaunchRequest {
        image_id: image_id.to_string(),
        instance_type: instance_type.to_string(),
        user_data: user_data.to_string(),
        key_name: options.key_name.clone(),
        min_count: 1,
        max_count: 1,
        security_group_ids: Vec::new(),
        subnet_id: None,
        network_interfaces: Vec::new(),
        availability_zone: options.availability_zone.clone(),
    };

    // The provider rejects top-level groups or subnet alongside interfaces
    if options.associate_public_ip {
        request.network_interfaces.push(NetworkInterfaceSpec {
            device_index: 0,
            subnet_id: options.subnet_id.clone(),
            security_group_ids: options.security_group_ids.clone(),
            associate_public_ip_address: true,
        });
    } else {
        request.security_group_ids = options.security_group_ids.clone();
        request.subnet_id = options.subnet_id.clone();
    }

    request
}

fn launch_tags(
    instance_type: &str,
    custom_tags: &BTreeMap<String, String>,
    options: &LaunchOptions,
) -> BTreeMap<String, String> {
    let mut tags = custom_tags.clone();
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| format!("{} {}", options.role.purpose(), options.group_uuid));

    tags.insert("Name".to_string(), name);
    tags.insert(GROUP_UUID_TAG.to_string(), options.group_uuid.clone());
    tags.insert(
        "NumberOfProcessors".to_string(),
        processor_count(instance_type, options.role).to_string(),
    );
    tags.insert(PURPOSE_TAG.to_string(), options.role.purpose().to_string());
    tags.insert("UserID".to_string(), options.user_id.clone());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use rstest::rstest;

    fn provisioner(provider: Arc<MockProvider>, policy: TimeoutPolicy) -> InstanceProvisioner {
        InstanceProvisioner::new(
            provider,
            LaunchTimings {
                poll_interval: Duration::from_secs(5),
                poll_timeout: Duration::from_secs(600),
                tag_retry: TAG_RETRY,
            },
            policy,
        )
    }

    fn options() -> LaunchOptions {
        let mut options = LaunchOptions::new(Role::Worker, "g1", "alice", "key");
        options.security_group_ids = vec!["sg-1".to_string()];
        options
    }

    fn no_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn test_reserved_tag_rejected_before_provider_call() {
        let provider = Arc::new(MockProvider::new());
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());

        for key in RESERVED_TAGS {
            let tags = BTreeMap::from([(key.to_string(), "x".to_string())]);
            let err = launcher
                .launch("ami-1", "m3.xlarge", "", &tags, &options())
                .await
                .unwrap_err();
            assert!(matches!(err, LaunchError::ReservedTag { key: ref k } if k == key));
        }
        assert_eq!(provider.provider_calls(), 0);
    }

    #[tokio::test]
    async fn test_launch_tags_instance() {
        let provider = Arc::new(MockProvider::new());
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());
        let custom = BTreeMap::from([("Project".to_string(), "demo".to_string())]);

        let instance = launcher
            .launch("ami-1", "c3.8xlarge", "#!/bin/bash", &custom, &options())
            .await
            .unwrap();

        assert_eq!(instance.processor_count, 16);
        let tags = provider.instance(&instance.provider_id).await.unwrap().tags;
        assert_eq!(tags["GroupUUID"], "g1");
        assert_eq!(tags["Purpose"], "OpenStudioWorker");
        assert_eq!(tags["NumberOfProcessors"], "16");
        assert_eq!(tags["UserID"], "alice");
        assert_eq!(tags["Project"], "demo");
    }

    #[test]
    fn test_public_ip_moves_groups_into_interface() {
        let mut opts = options();
        opts.subnet_id = Some("subnet-1".to_string());

        let plain = build_request("ami-1", "m3.xlarge", "", &opts);
        assert_eq!(plain.security_group_ids, vec!["sg-1"]);
        assert!(plain.network_interfaces.is_empty());

        opts.associate_public_ip = true;
        let public = build_request("ami-1", "m3.xlarge", "", &opts);
        assert!(public.security_group_ids.is_empty());
        assert!(public.subnet_id.is_none());
        assert_eq!(public.network_interfaces[0].security_group_ids, vec!["sg-1"]);
        assert_eq!(public.network_interfaces[0].subnet_id.as_deref(), Some("subnet-1"));
        assert_eq!((public.min_count, public.max_count), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagging_retries_transient_not_found() {
        let provider = Arc::new(MockProvider::new().with_tag_failures(2));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());

        let instance = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &options())
            .await
            .unwrap();
        let tags = provider.instance(&instance.provider_id).await.unwrap().tags;
        assert_eq!(tags["GroupUUID"], "g1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagging_gives_up_after_three_attempts() {
        let provider = Arc::new(MockProvider::new().with_tag_failures(3));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Tagging { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_timeout_names_instance_and_leaves_it() {
        let provider = Arc::new(MockProvider::new().with_boot_polls(None));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::LeaveAndReport);

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &options())
            .await
            .unwrap_err();

        let instance_id = err.instance_id().unwrap().to_string();
        assert!(matches!(
            err,
            LaunchError::InstanceTimeout { ref elapsed, .. } if *elapsed >= Duration::from_secs(600)
        ));
        assert!(err.to_string().contains(&instance_id));
        let left = provider.instance(&instance_id).await.unwrap();
        assert_eq!(left.state, InstanceState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_timeout_terminates_under_policy() {
        let provider = Arc::new(MockProvider::new().with_boot_polls(None));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::Terminate);

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &options())
            .await
            .unwrap_err();

        let instance_id = err.instance_id().unwrap();
        let left = provider.instance(instance_id).await.unwrap();
        assert_eq!(left.state, InstanceState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_created_and_attached() {
        let provider = Arc::new(
            MockProvider::new()
                .with_boot_polls(Some(2))
                .with_volume_polls(Some(1)),
        );
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());
        let mut opts = options();
        opts.ebs_volume_size_gb = Some(100);

        let instance = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &opts)
            .await
            .unwrap();

        let attachments = provider.attachments().await;
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].1, instance.provider_id);
        assert_eq!(attachments[0].2, VOLUME_DEVICE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_timeout_names_volume() {
        let provider = Arc::new(MockProvider::new().with_volume_polls(None));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::default());
        let mut opts = options();
        opts.ebs_volume_size_gb = Some(50);

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &opts)
            .await
            .unwrap_err();

        match err {
            LaunchError::VolumeTimeout { volume_id, .. } => assert!(volume_id.starts_with("vol-")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(provider.attachments().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_timeout_deletes_volume_under_policy() {
        let provider = Arc::new(MockProvider::new().with_volume_polls(None));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::Terminate);
        let mut opts = options();
        opts.ebs_volume_size_gb = Some(50);

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &opts)
            .await
            .unwrap_err();

        let (volume_id, instance_id) = match err {
            LaunchError::VolumeTimeout {
                volume_id,
                instance_id,
                ..
            } => (volume_id, instance_id),
            other => panic!("unexpected error: {other}"),
        };
        assert!(provider.volume(&volume_id).await.is_none());
        let left = provider.instance(&instance_id).await.unwrap();
        assert_eq!(left.state, InstanceState::Terminated);
    }

    #[rstest]
    #[case::fatal_tag_error("create_tags", 0, None)]
    #[case::describe_while_waiting("describe_instances", 0, None)]
    #[case::create_volume("create_volume", 0, Some(10))]
    #[case::describe_volume("describe_volume", 0, Some(10))]
    #[case::final_describe("describe_instances", 1, None)]
    #[tokio::test(start_paused = true)]
    async fn test_errors_after_submission_name_instance(
        #[case] operation: &'static str,
        #[case] successes: u32,
        #[case] volume_gb: Option<u32>,
    ) {
        let provider = Arc::new(MockProvider::new().with_failure_after(operation, successes));
        let launcher = provisioner(provider.clone(), TimeoutPolicy::LeaveAndReport);
        let mut opts = options();
        opts.ebs_volume_size_gb = volume_gb;

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &opts)
            .await
            .unwrap_err();

        assert!(
            matches!(err, LaunchError::AfterLaunch { ref source, .. } if source.to_string().contains(operation)),
            "{err}"
        );
        let instance_id = err.instance_id().unwrap();
        assert!(err.to_string().contains(instance_id));
        assert!(provider.instance(instance_id).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_submission_has_no_instance() {
        let provider = Arc::new(MockProvider::new().with_failure_after("run_instance", 0));
        let launcher = provisioner(provider, TimeoutPolicy::Terminate);

        let err = launcher
            .launch("ami-1", "m3.xlarge", "", &no_tags(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Provider(_)));
        assert_eq!(err.instance_id(), None);
    }
}
