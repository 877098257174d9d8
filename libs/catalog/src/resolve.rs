//! Merge a provider image listing into a version-ordered catalog.
//!
//! Resolution runs in three passes:
//!
//! 1. Group managed images by their server build tag and classify each one
//!    as server, worker or (legacy only) cc2 worker.
//! 2. Invert the build index into `software -> build -> amis`, with
//!    `default` aliases chosen by semantic-version order.
//! 3. For the v2 schema, overlay stable markers and back-fill them onto
//!    newer software versions that have none.
//!
//! Inputs are sorted before processing so the result never depends on the
//! order the provider returned images in.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::CatalogError;
use crate::model::{
    AmiSet, BuildEntry, MergedCatalog, ProviderImage, SchemaTag, ServerBuild, SoftwareIndex,
    SoftwareVersionEntry, SERVER_BUILD_VERSION_TAG, SOFTWARE_VERSION_TAG, TESTED_TAG,
};
use crate::version::Version;

/// Software versions older than this ship separate cc2 worker images.
const LEGACY_BEFORE: (u64, u64, u64) = (1, 5, 0);

/// Externally supplied stable markers for the v2 schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableOverlay {
    /// Software versions at or below this are never back-filled.
    pub baseline: Version,

    /// Explicit `software version -> stable server build` markers.
    pub stable: BTreeMap<Version, Version>,
}

/// Catalog formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSchema {
    /// Builds and default aliases only.
    V1,
    /// V1 plus stable markers with back-fill.
    V2(StableOverlay),
}

impl CatalogSchema {
    fn tag(&self) -> SchemaTag {
        match self {
            Self::V1 => SchemaTag::V1,
            Self::V2(_) => SchemaTag::V2,
        }
    }
}

/// Which slot of an [`AmiSet`] an image fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageRole {
    Server,
    Worker,
    Cc2Worker,
}

/// An image accepted into a build group.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    image: &'a ProviderImage,
    role: ImageRole,
}

#[derive(Debug, Default)]
struct BuildGroup<'a> {
    software_version: Option<Version>,
    candidates: Vec<Candidate<'a>>,
}

/// Resolves provider image listings into a [`MergedCatalog`].
#[derive(Debug, Clone)]
pub struct AmiCatalogResolver {
    schema: CatalogSchema,
}

impl AmiCatalogResolver {
    /// Create a resolver for the given schema.
    pub fn new(schema: CatalogSchema) -> Self {
        Self { schema }
    }

    /// The schema this resolver produces.
    pub fn schema(&self) -> &CatalogSchema {
        &self.schema
    }

    /// Merge `images` with the curated fields of `existing`.
    ///
    /// `existing` contributes `tested` flags and explicit stable markers
    /// only. Provider-reported fields always come from `images`.
    pub fn resolve(
        &self,
        existing: Option<&MergedCatalog>,
        images: &[ProviderImage],
    ) -> Result<MergedCatalog, CatalogError> {
        let groups = group_by_build(images)?;

        let mut openstudio_server = BTreeMap::new();
        let mut versions: BTreeMap<Version, SoftwareVersionEntry> = BTreeMap::new();

        for (build, group) in groups {
            let Some(software_version) = group.software_version else {
                continue;
            };
            let (amis, tested, created_on) = merge_candidates(&build, &group.candidates);
            let tested = tested || previously_tested(existing, &software_version, &build);

            openstudio_server.insert(
                build.clone(),
                ServerBuild {
                    openstudio_version: software_version.clone(),
                    amis: amis.clone(),
                    tested,
                    created_on: created_on.clone(),
                },
            );

            let entry = versions
                .entry(software_version)
                .or_insert_with(|| SoftwareVersionEntry {
                    default: build.clone(),
                    stable: None,
                    stable_inherited: false,
                    builds: BTreeMap::new(),
                });
            entry.builds.insert(
                build,
                BuildEntry {
                    amis,
                    tested,
                    created_on,
                },
            );
        }

        // Defaults come from an explicit sort, never from insertion order.
        for entry in versions.values_mut() {
            if let Some(newest) = entry.builds.keys().next_back() {
                entry.default = newest.clone();
            }
        }

        if let CatalogSchema::V2(overlay) = &self.schema {
            apply_stable_overlay(&mut versions, overlay, existing);
        }

        let default = versions.keys().next_back().cloned();

        Ok(MergedCatalog {
            schema: self.schema.tag(),
            openstudio: SoftwareIndex { default, versions },
            openstudio_server,
        })
    }
}

/// Pass 1: group managed images by server build and classify them.
fn group_by_build(
    images: &[ProviderImage],
) -> Result<BTreeMap<Version, BuildGroup<'_>>, CatalogError> {
    let mut sorted: Vec<&ProviderImage> = images.iter().collect();
    sorted.sort_by(|a, b| a.image_id.cmp(&b.image_id));

    let mut groups: BTreeMap<Version, BuildGroup<'_>> = BTreeMap::new();

    for image in sorted {
        let Some(build) = image.tag(SERVER_BUILD_VERSION_TAG) else {
            continue;
        };
        let build = match Version::parse(build) {
            Ok(v) => v,
            Err(_) => {
                warn!(image_id = %image.image_id, build, "Unparseable server build tag, skipping image");
                continue;
            }
        };
        let Some(software) = image.tag(SOFTWARE_VERSION_TAG) else {
            debug!(image_id = %image.image_id, "Image has no software version tag, skipping");
            continue;
        };
        let software = match Version::parse(software) {
            Ok(v) => v,
            Err(_) => {
                warn!(image_id = %image.image_id, software, "Unparseable software version tag, skipping image");
                continue;
            }
        };

        let Some(role) = classify(image, &software)? else {
            debug!(image_id = %image.image_id, name = %image.name, "Image is neither server nor worker, skipping");
            continue;
        };

        let group = groups.entry(build.clone()).or_default();
        match &group.software_version {
            Some(existing) if existing != &software => {
                return Err(CatalogError::ConflictingSoftwareVersion {
                    build: build.to_string(),
                    first: existing.to_string(),
                    second: software.to_string(),
                    image_id: image.image_id.clone(),
                });
            }
            Some(_) => {}
            None => group.software_version = Some(software),
        }
        group.candidates.push(Candidate { image, role });
    }

    Ok(groups)
}

/// Decide which slot an image fills, by name and (for legacy builds)
/// virtualization type.
fn classify(image: &ProviderImage, software: &Version) -> Result<Option<ImageRole>, CatalogError> {
    let name = image.name.to_ascii_lowercase();

    if name.contains("server") {
        return Ok(Some(ImageRole::Server));
    }
    if !name.contains("worker") {
        return Ok(None);
    }

    let (major, minor, patch) = LEGACY_BEFORE;
    if !software.is_older_than(major, minor, patch) {
        return Ok(Some(ImageRole::Worker));
    }

    match image.virtualization_type.as_deref() {
        Some("hvm") => Ok(Some(ImageRole::Cc2Worker)),
        Some("paravirtual") => Ok(Some(ImageRole::Worker)),
        other => Err(CatalogError::UnknownVirtualization {
            image_id: image.image_id.clone(),
            virtualization_type: other.unwrap_or("").to_string(),
        }),
    }
}

/// Fill an [`AmiSet`] from a build's candidates.
///
/// When two images claim the same slot, the newest `created_on` wins, then
/// the greatest image id.
fn merge_candidates(build: &Version, candidates: &[Candidate<'_>]) -> (AmiSet, bool, Option<String>) {
    let mut amis = AmiSet::default();
    let mut chosen: BTreeMap<u8, &ProviderImage> = BTreeMap::new();

    for candidate in candidates {
        let slot = match candidate.role {
            ImageRole::Server => 0,
            ImageRole::Worker => 1,
            ImageRole::Cc2Worker => 2,
        };
        match chosen.get(&slot).copied() {
            Some(current) if newer_than(current, candidate.image) => {}
            Some(current) => {
                warn!(
                    build = %build,
                    kept = %candidate.image.image_id,
                    dropped = %current.image_id,
                    "Duplicate image for build slot"
                );
                chosen.insert(slot, candidate.image);
            }
            None => {
                chosen.insert(slot, candidate.image);
            }
        }
    }

    for (slot, image) in &chosen {
        let id = Some(image.image_id.clone());
        match slot {
            0 => amis.server = id,
            1 => amis.worker = id,
            _ => amis.cc2worker = id,
        }
    }

    let tested = !chosen.is_empty()
        && chosen
            .values()
            .all(|image| image.tag(TESTED_TAG).is_some_and(|t| t.eq_ignore_ascii_case("true")));
    let created_on = chosen
        .get(&0)
        .or_else(|| chosen.values().next())
        .and_then(|image| image.created_on.clone());

    (amis, tested, created_on)
}

fn newer_than(a: &ProviderImage, b: &ProviderImage) -> bool {
    (&a.created_on, &a.image_id) > (&b.created_on, &b.image_id)
}

fn previously_tested(existing: Option<&MergedCatalog>, software: &Version, build: &Version) -> bool {
    existing
        .and_then(|catalog| catalog.openstudio.versions.get(software))
        .and_then(|sw| sw.builds.get(build))
        .is_some_and(|entry| entry.tested)
}

/// Pass 3: explicit stable markers, then back-fill newer versions.
fn apply_stable_overlay(
    versions: &mut BTreeMap<Version, SoftwareVersionEntry>,
    overlay: &StableOverlay,
    existing: Option<&MergedCatalog>,
) {
    let mut last_stable: Option<Version> = None;

    for (software, entry) in versions.iter_mut() {
        let explicit = overlay.stable.get(software).cloned().or_else(|| {
            existing
                .and_then(|catalog| catalog.openstudio.versions.get(software))
                .filter(|sw| !sw.stable_inherited)
                .and_then(|sw| sw.stable.clone())
        });

        match explicit {
            Some(build) => {
                entry.stable = Some(build.clone());
                entry.stable_inherited = false;
                last_stable = Some(build);
            }
            None if software > &overlay.baseline => {
                entry.stable = last_stable.clone();
                entry.stable_inherited = last_stable.is_some();
            }
            None => {
                entry.stable = None;
                entry.stable_inherited = false;
            }
        }
    }
}
