//! Catalog fetch through the provider.

use osc_catalog::{AmiCatalogResolver, CatalogError, MergedCatalog};
use thiserror::Error;
use tracing::info;

use crate::provider::{ComputeProvider, ProviderError};

/// Catalog fetch errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// List the provider's images once and merge them into a catalog.
pub async fn fetch_catalog(
    provider: &dyn ComputeProvider,
    resolver: &AmiCatalogResolver,
    existing: Option<&MergedCatalog>,
    owner: Option<&str>,
) -> Result<MergedCatalog, FetchError> {
    let images = provider.describe_images(owner).await?;
    let catalog = resolver.resolve(existing, &images)?;
    info!(
        images = images.len(),
        software_versions = catalog.openstudio.versions.len(),
        builds = catalog.openstudio_server.len(),
        "Resolved image catalog"
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, ProviderImage};
    use osc_catalog::CatalogSchema;
    use std::collections::BTreeMap;

    fn image(id: &str, name: &str, build: &str, software: &str) -> ProviderImage {
        ProviderImage {
            image_id: id.to_string(),
            name: name.to_string(),
            virtualization_type: Some("hvm".to_string()),
            created_on: None,
            tags: BTreeMap::from([
                ("server_build_version".to_string(), build.to_string()),
                ("openstudio_version".to_string(), software.to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_fetch_resolves_listing() {
        let provider = MockProvider::new().with_images(vec![
            image("ami-s", "OpenStudio-Server 1.8.0", "1.8.0", "1.8.0"),
            image("ami-w", "OpenStudio-Worker 1.8.0", "1.8.0", "1.8.0"),
        ]);
        let resolver = AmiCatalogResolver::new(CatalogSchema::V1);

        let catalog = fetch_catalog(&provider, &resolver, None, None).await.unwrap();
        let build = catalog.software("1.8.0").unwrap().build("1.8.0").unwrap();
        assert_eq!(build.amis.server.as_deref(), Some("ami-s"));
        assert_eq!(build.amis.worker.as_deref(), Some("ami-w"));
        assert_eq!(provider.provider_calls(), 1);
    }
}
