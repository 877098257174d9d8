//! Catalog input and output types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Tag carrying the server build an image belongs to.
pub const SERVER_BUILD_VERSION_TAG: &str = "server_build_version";

/// Tag carrying the software version an image ships.
pub const SOFTWARE_VERSION_TAG: &str = "openstudio_version";

/// Tag marking an image as tested.
pub const TESTED_TAG: &str = "tested";

/// An image as reported by the provider's image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderImage {
    pub image_id: String,
    pub name: String,
    #[serde(default)]
    pub virtualization_type: Option<String>,
    #[serde(default)]
    pub created_on: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ProviderImage {
    /// Look up a tag value, treating blank values as absent.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Image ids for one server build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Hardware-virtualization worker variant, legacy builds only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc2worker: Option<String>,
}

/// One server build under a software version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
    pub amis: AmiSet,
    #[serde(default)]
    pub tested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<String>,
}

/// All server builds of one software version.
///
/// Serialized as a flat object: `default`, optional `stable`, then one key
/// per build version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareVersionEntry {
    /// Newest server build for this software version.
    pub default: Version,

    /// Server build known to be good for this software version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable: Option<Version>,

    /// True when `stable` was back-filled from an older software version.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stable_inherited: bool,

    #[serde(flatten)]
    pub builds: BTreeMap<Version, BuildEntry>,
}

impl SoftwareVersionEntry {
    /// Look up a build by its version string.
    pub fn build(&self, build: &str) -> Option<&BuildEntry> {
        let key = Version::parse(build).ok()?;
        self.builds.get(&key)
    }

    /// The build the `default` alias points at.
    pub fn default_build(&self) -> Option<&BuildEntry> {
        self.builds.get(&self.default)
    }
}

/// Software versions, plus a `default` alias for the newest one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Version>,

    #[serde(flatten)]
    pub versions: BTreeMap<Version, SoftwareVersionEntry>,
}

/// One server build as indexed by build version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBuild {
    pub openstudio_version: Version,
    pub amis: AmiSet,
    #[serde(default)]
    pub tested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<String>,
}

/// Catalog schema tag recorded in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaTag {
    V1,
    V2,
}

/// The merged, version-ordered catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedCatalog {
    pub schema: SchemaTag,
    pub openstudio: SoftwareIndex,
    pub openstudio_server: BTreeMap<Version, ServerBuild>,
}

impl MergedCatalog {
    /// Look up a software version by its version string.
    pub fn software(&self, version: &str) -> Option<&SoftwareVersionEntry> {
        let key = Version::parse(version).ok()?;
        self.openstudio.versions.get(&key)
    }

    /// Newest software version, if any.
    pub fn default_software_version(&self) -> Option<&Version> {
        self.openstudio.default.as_ref()
    }

    /// Flat listing of complete builds ordered by (software, build).
    pub fn entries(&self) -> Vec<AmiCatalogEntry> {
        let mut out = Vec::new();
        for (software_version, sw) in &self.openstudio.versions {
            for (build, entry) in &sw.builds {
                let (Some(server), Some(worker)) = (&entry.amis.server, &entry.amis.worker)
                else {
                    continue;
                };
                let stable_for = (sw.stable.as_ref() == Some(build) && !sw.stable_inherited)
                    .then(|| software_version.clone());
                out.push(AmiCatalogEntry {
                    software_version: software_version.clone(),
                    server_build_version: build.clone(),
                    server_image_id: server.clone(),
                    worker_image_id: worker.clone(),
                    cc2_variant_image_id: entry.amis.cc2worker.clone(),
                    tested: entry.tested,
                    created_on: entry.created_on.clone(),
                    stable_for,
                });
            }
        }
        out
    }
}

/// A complete catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiCatalogEntry {
    pub software_version: Version,
    pub server_build_version: Version,
    pub server_image_id: String,
    pub worker_image_id: String,
    pub cc2_variant_image_id: Option<String>,
    pub tested: bool,
    pub created_on: Option<String>,
    /// Set to the software version this build is explicitly stable for.
    pub stable_for: Option<Version>,
}
