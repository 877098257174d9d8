//! Error types for catalog resolution.

use thiserror::Error;

/// Errors that can occur while resolving or querying an AMI catalog.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// A version string could not be parsed.
    #[error("invalid version: '{0}'")]
    InvalidVersion(String),

    /// A legacy worker image has a virtualization type we cannot classify.
    #[error("resolve: image {image_id} is a legacy worker with unknown virtualization type '{virtualization_type}'")]
    UnknownVirtualization {
        image_id: String,
        virtualization_type: String,
    },

    /// Images of one server build disagree on their software version.
    #[error("resolve: server build {build} is tagged with software versions {first} and {second} (image {image_id})")]
    ConflictingSoftwareVersion {
        build: String,
        first: String,
        second: String,
        image_id: String,
    },

    /// The requested software version is not in the catalog.
    #[error("select: software version {0} not found in catalog")]
    UnknownSoftwareVersion(String),

    /// The catalog has no entries at all.
    #[error("select: catalog is empty")]
    EmptyCatalog,

    /// The selected build does not have both a server and a worker image.
    #[error("select: server build {build} for software version {software_version} is missing its {role} image")]
    IncompleteBuild {
        software_version: String,
        build: String,
        role: &'static str,
    },
}
