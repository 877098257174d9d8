//! Pick the image ids to launch from a resolved catalog.

use serde::Serialize;

use crate::error::CatalogError;
use crate::model::MergedCatalog;
use crate::version::Version;

/// Image ids chosen for one cluster launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmiSelection {
    pub software_version: Version,
    pub server_build_version: Version,
    pub server: String,
    pub worker: String,
    pub cc2worker: Option<String>,
}

/// Choose images for `software_version`, or for the newest software version
/// when `None`.
///
/// With `prefer_stable`, the software version's stable build is used when it
/// has one; otherwise its `default` build.
pub fn select_amis(
    catalog: &MergedCatalog,
    software_version: Option<&str>,
    prefer_stable: bool,
) -> Result<AmiSelection, CatalogError> {
    let (software, entry) = match software_version {
        Some(requested) => {
            let key = Version::parse(requested)?;
            let entry = catalog
                .openstudio
                .versions
                .get(&key)
                .ok_or_else(|| CatalogError::UnknownSoftwareVersion(requested.to_string()))?;
            (key, entry)
        }
        None => {
            let key = catalog
                .default_software_version()
                .ok_or(CatalogError::EmptyCatalog)?;
            let entry = catalog
                .openstudio
                .versions
                .get(key)
                .ok_or(CatalogError::EmptyCatalog)?;
            (key.clone(), entry)
        }
    };

    let build = match (&entry.stable, prefer_stable) {
        (Some(stable), true) => stable.clone(),
        _ => entry.default.clone(),
    };

    // Inherited stable builds live under an older software version.
    let amis = entry
        .builds
        .get(&build)
        .map(|b| &b.amis)
        .or_else(|| catalog.openstudio_server.get(&build).map(|b| &b.amis))
        .ok_or_else(|| CatalogError::IncompleteBuild {
            software_version: software.to_string(),
            build: build.to_string(),
            role: "server",
        })?;

    let missing = |role: &'static str| CatalogError::IncompleteBuild {
        software_version: software.to_string(),
        build: build.to_string(),
        role,
    };

    Ok(AmiSelection {
        server: amis.server.clone().ok_or_else(|| missing("server"))?,
        worker: amis.worker.clone().ok_or_else(|| missing("worker"))?,
        cc2worker: amis.cc2worker.clone(),
        software_version: software,
        server_build_version: build,
    })
}
