//! # osc-catalog
//!
//! Version-aware AMI catalog resolution.
//!
//! The provider publishes machine images tagged with the server build and
//! software version they carry. This library reconciles that listing with a
//! previously published catalog and produces a structure keyed by
//! semantic version:
//!
//! ```text
//! openstudio:
//!   default: 2.1.0
//!   2.1.0:
//!     default: 2.1.2
//!     stable: 2.0.4          (v2 only)
//!     2.1.2: { amis: { server, worker }, tested }
//! openstudio_server:
//!   2.1.2: { openstudio_version: 2.1.0, amis: { server, worker } }
//! ```
//!
//! Resolution is pure: the same inputs always produce the same catalog,
//! whatever order the images arrive in.

mod error;
mod model;
mod resolve;
mod select;
mod version;

pub use error::CatalogError;
pub use model::{
    AmiCatalogEntry, AmiSet, BuildEntry, MergedCatalog, ProviderImage, SchemaTag, ServerBuild,
    SoftwareIndex, SoftwareVersionEntry, SERVER_BUILD_VERSION_TAG, SOFTWARE_VERSION_TAG,
    TESTED_TAG,
};
pub use resolve::{AmiCatalogResolver, CatalogSchema, StableOverlay};
pub use select::{select_amis, AmiSelection};
pub use version::Version;
