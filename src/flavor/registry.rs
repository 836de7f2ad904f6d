//! Provider-scoped registries of the versions a matrix uses.
//!
//! Both registries keep entries in order of first appearance and never hold
//! duplicates. Registering an already known machine image version with a new
//! architecture merges the architecture into the existing entry.

use std::collections::BTreeMap;

use serde::Serialize;

use super::CloudProvider;
use crate::version::{ExpirableVersion, MachineImageVersion};

/// Kubernetes versions used per provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KubernetesVersionRegistry(BTreeMap<CloudProvider, Vec<ExpirableVersion>>);

impl KubernetesVersionRegistry {
    /// Registers a version. Returns `false` if it was already known.
    pub fn add(&mut self, provider: &CloudProvider, version: &ExpirableVersion) -> bool {
        let versions = self.0.entry(provider.clone()).or_default();
        if versions.iter().any(|v| v.version == version.version) {
            return false;
        }
        versions.push(version.clone());
        true
    }

    pub fn get(&self, provider: &CloudProvider) -> &[ExpirableVersion] {
        self.0.get(provider).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CloudProvider, &[ExpirableVersion])> {
        self.0.iter().map(|(p, v)| (p, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Machine image versions used per provider and image name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MachineImageRegistry(
    BTreeMap<CloudProvider, BTreeMap<String, Vec<MachineImageVersion>>>,
);

impl MachineImageRegistry {
    /// Registers `image` at `version` for `architecture`.
    pub fn add(
        &mut self,
        provider: &CloudProvider,
        image: &str,
        version: &ExpirableVersion,
        architecture: &str,
    ) {
        let versions = self
            .0
            .entry(provider.clone())
            .or_default()
            .entry(image.to_string())
            .or_default();

        match versions.iter_mut().find(|v| v.version == version.version) {
            Some(existing) => {
                existing.architectures.insert(architecture.to_string());
            }
            None => versions.push(MachineImageVersion {
                version: version.version.clone(),
                architectures: [architecture.to_string()].into(),
                expiration_date: version.expiration_date,
            }),
        }
    }

    pub fn get(&self, provider: &CloudProvider, image: &str) -> &[MachineImageVersion] {
        self.0
            .get(provider)
            .and_then(|images| images.get(image))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&CloudProvider, &BTreeMap<String, Vec<MachineImageVersion>>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
