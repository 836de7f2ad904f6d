//! Version catalogs and the providers that supply them.
//!
//! A [`VersionCatalog`] lists the Kubernetes versions and machine images a
//! cloud profile offers. The flavor expander fetches catalogs through the
//! [`VersionCatalogProvider`] trait, so catalogs can come from static
//! configuration ([`StaticCatalogProvider`]) or from a live control plane.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::version::{ExpirableVersion, MachineImageVersion};

/// Result type for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors that can occur while fetching a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No catalog is registered under the requested reference.
    #[error("Catalog not found: {0}")]
    NotFound(String),
}

/// Versions offered by one cloud profile.
///
/// # TOML Structure
///
/// ```toml
/// [catalogs.aws]
/// kubernetes = [
///     { version = "1.15.2" },
///     { version = "1.14.6", expirationDate = "2030-01-01T00:00:00Z" },
/// ]
///
/// [catalogs.aws.machine_images]
/// gardenlinux = [{ version = "3.5.0", architectures = ["amd64", "arm64"] }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCatalog {
    /// Kubernetes versions in catalog order.
    #[serde(default)]
    pub kubernetes: Vec<ExpirableVersion>,

    /// Machine image versions keyed by image name.
    #[serde(default)]
    pub machine_images: BTreeMap<String, Vec<MachineImageVersion>>,
}

/// Supplies version catalogs by reference.
///
/// The reference is a cloud profile name for extended flavors and the
/// provider name for base flavors.
#[async_trait]
pub trait VersionCatalogProvider: Send + Sync {
    async fn catalog(&self, reference: &str) -> CatalogResult<VersionCatalog>;
}

/// Catalog provider backed by an in-memory map, usually filled from the
/// `[catalogs]` section of the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogProvider {
    catalogs: HashMap<String, VersionCatalog>,
}

impl StaticCatalogProvider {
    pub fn new(catalogs: impl IntoIterator<Item = (String, VersionCatalog)>) -> Self {
        Self {
            catalogs: catalogs.into_iter().collect(),
        }
    }

    /// Registers or replaces the catalog for `reference`.
    pub fn insert(&mut self, reference: impl Into<String>, catalog: VersionCatalog) {
        self.catalogs.insert(reference.into(), catalog);
    }
}

#[async_trait]
impl VersionCatalogProvider for StaticCatalogProvider {
    async fn catalog(&self, reference: &str) -> CatalogResult<VersionCatalog> {
        self.catalogs
            .get(reference)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_lookup() {
        let mut provider = StaticCatalogProvider::default();
        provider.insert(
            "aws",
            VersionCatalog {
                kubernetes: vec![ExpirableVersion::new("1.15.2")],
                machine_images: BTreeMap::new(),
            },
        );

        let catalog = provider.catalog("aws").await.unwrap();
        assert_eq!(catalog.kubernetes[0].version, "1.15.2");

        let err = provider.catalog("gcp").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(ref r) if r == "gcp"));
    }

    #[test]
    fn test_catalog_from_toml() {
        let catalog: VersionCatalog = toml::from_str(
            r#"
            kubernetes = [
                { version = "1.15.2" },
                { version = "1.14.6", expirationDate = "2030-01-01T00:00:00Z" },
            ]

            [machine_images]
            gardenlinux = [{ version = "3.5.0", architectures = ["amd64", "arm64"] }]
            "#,
        )
        .unwrap();

        assert_eq!(catalog.kubernetes.len(), 2);
        assert!(catalog.kubernetes[0].expiration_date.is_none());
        assert!(catalog.kubernetes[1].expiration_date.is_some());
        let images = &catalog.machine_images["gardenlinux"];
        assert!(images[0].supports("arm64"));
    }
}
