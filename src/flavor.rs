//! Flavor expansion into a concrete test matrix.
//!
//! A flavor describes a family of test clusters: one cloud provider, a
//! Kubernetes version selector and optional worker pool groups. Expansion
//! validates every flavor, resolves its versions against the provider's
//! catalog and emits one [`ResolvedInstance`] per version and worker group.
//!
//! ```text
//!  FlavorSpec ──validate──► ok ──catalog(ref)──► VersionCatalog
//!                                                     │
//!                          VersionResolver ◄──────────┘
//!                                │
//!            versions × worker groups ("latest" images resolved)
//!                                │
//!                                ▼
//!                           FlavorMatrix
//!              instances + used versions + used images
//! ```
//!
//! Extended flavors carry the data needed to create a cluster in a project
//! (cloud profile, region, binding) and produce instances with generated
//! names.

pub mod registry;
pub mod validation;

pub use registry::{KubernetesVersionRegistry, MachineImageRegistry};
pub use validation::{
    FieldError, ValidationErrors, validate_extended_flavors, validate_flavor, validate_flavors,
};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::annotations;
use crate::catalog::{CatalogError, VersionCatalog, VersionCatalogProvider};
use crate::version::{
    ExpirableVersion, PATTERN_LATEST, ResolutionError, VersionResolver, VersionSelector,
};

/// Architecture assumed for worker pools that do not name one.
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Architectures a worker pool may request.
pub const ALLOWED_ARCHITECTURES: [&str; 2] = ["amd64", "arm64"];

/// Prefix for generated instance names.
pub const DEFAULT_SHOOT_PREFIX: &str = "tm-";

/// Result type for flavor expansion.
pub type FlavorResult<T> = Result<T, FlavorError>;

/// Errors that abort flavor expansion.
#[derive(Debug, thiserror::Error)]
pub enum FlavorError {
    /// One or more flavors are invalid.
    #[error("invalid flavors:\n{0}")]
    Validation(#[from] ValidationErrors),

    /// A flavor's versions could not be resolved.
    #[error("{path}: {source}")]
    Resolution {
        path: String,
        source: ResolutionError,
    },

    /// A catalog could not be fetched.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Name of a cloud provider, e.g. `aws` or `gcp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudProvider(String);

impl CloudProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Machine image name and version (a concrete version or `"latest"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineImage {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_image_version")]
    pub version: String,
}

fn default_image_version() -> String {
    PATTERN_LATEST.to_string()
}

impl MachineImage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, PATTERN_LATEST)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "type", default)]
    pub machine_type: String,

    #[serde(default)]
    pub image: MachineImage,

    /// CPU architecture, [`DEFAULT_ARCHITECTURE`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// A named machine configuration within a test instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub machine: Machine,

    #[serde(default)]
    pub minimum: u32,

    #[serde(default)]
    pub maximum: u32,
}

impl WorkerPool {
    /// Architecture with the default applied.
    pub fn architecture(&self) -> &str {
        self.machine
            .architecture
            .as_deref()
            .unwrap_or(DEFAULT_ARCHITECTURE)
    }
}

/// Worker pools that are tested together in one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroup {
    #[serde(default)]
    pub worker_pools: Vec<WorkerPool>,
}

/// An additional source location carried through to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "type")]
    pub location_type: String,
    pub repo: String,
    pub revision: String,
}

/// Abstract description of one or more test configurations.
///
/// # TOML Structure
///
/// ```toml
/// [[flavors]]
/// provider = "aws"
/// kubernetes = { pattern = "latest" }
///
/// [[flavors.workers]]
/// [[flavors.workers.workerPools]]
/// name = "wp1"
/// machine = { type = "m5.large", image = { name = "gardenlinux" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorSpec {
    #[serde(default)]
    pub provider: CloudProvider,

    #[serde(default)]
    pub kubernetes: VersionSelector,

    /// Worker pool groups; `None` yields one instance without workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerGroup>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_locations: Vec<Location>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privileged_containers: Option<bool>,
}

/// Project-level settings of an extended flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedConfig {
    #[serde(default)]
    pub cloudprofile: String,

    #[serde(default)]
    pub project_name: String,

    #[serde(default)]
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_binding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_binding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_pool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalancer_provider: Option<String>,
}

/// A flavor plus the settings needed to create its clusters in a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedFlavorSpec {
    #[serde(flatten)]
    pub flavor: FlavorSpec,

    #[serde(flatten)]
    pub config: ExtendedConfig,
}

/// Credentials reference of an extended instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Binding {
    SecretBinding(String),
    CredentialsBinding(String),
}

/// Identity and placement of an instance created from an extended flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedInstance {
    pub name: String,
    pub namespace: String,
    pub project_name: String,
    pub cloudprofile: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    pub binding: Binding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floating_pool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loadbalancer_provider: Option<String>,
}

impl ExtendedInstance {
    fn from_config(config: &ExtendedConfig, prefix: &str) -> Self {
        let binding = match (&config.secret_binding, &config.credentials_binding) {
            (Some(secret), _) if !secret.is_empty() => Binding::SecretBinding(secret.clone()),
            (_, Some(credentials)) => Binding::CredentialsBinding(credentials.clone()),
            (secret, None) => Binding::SecretBinding(secret.clone().unwrap_or_default()),
        };
        Self {
            name: format!("{prefix}{}", random_suffix(3)),
            namespace: format!("garden-{}", config.project_name),
            project_name: config.project_name.clone(),
            cloudprofile: config.cloudprofile.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            binding,
            floating_pool_name: config.floating_pool_name.clone(),
            loadbalancer_provider: config.loadbalancer_provider.clone(),
        }
    }

    /// Name for a fresh attempt of this instance: the current name with a
    /// new random suffix.
    pub fn new_attempt_name(&self) -> String {
        format!("{}-{}", self.name, random_suffix(3))
    }
}

/// One concrete matrix cell.
///
/// Every worker pool has its architecture set and a concrete image version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInstance {
    pub provider: CloudProvider,
    pub kubernetes_version: ExpirableVersion,
    pub workers: Vec<WorkerPool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_locations: Vec<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_privileged_containers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<ExtendedInstance>,
}

impl ResolvedInstance {
    /// Image name of the first worker pool.
    pub fn operating_system(&self) -> Option<&str> {
        self.workers.first().map(|w| w.machine.image.name.as_str())
    }

    /// `provider/k8sVersion/os`, followed by `/NoPrivCtrs` when privileged
    /// containers are disallowed and by the flavor description if present.
    pub fn dimension(&self) -> String {
        let mut dimension = format!(
            "{}/{}/{}",
            self.provider,
            self.kubernetes_version.version,
            self.operating_system().unwrap_or_default()
        );
        if self.allow_privileged_containers == Some(false) {
            dimension.push_str("/NoPrivCtrs");
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            dimension.push('/');
            dimension.push_str(description);
        }
        dimension
    }

    /// Metadata annotations describing this instance, merged over the
    /// flavor's own annotations.
    pub fn metadata_annotations(&self) -> BTreeMap<String, String> {
        let mut out = self.annotations.clone();
        let mut set = |key: &str, value: String| {
            out.insert(key.to_string(), value);
        };

        set(annotations::CLOUD_PROVIDER, self.provider.to_string());
        set(annotations::K8S_VERSION, self.kubernetes_version.version.clone());
        if let Some(pool) = self.workers.first() {
            set(annotations::OPERATING_SYSTEM, pool.machine.image.name.clone());
            set(
                annotations::OPERATING_SYSTEM_VERSION,
                pool.machine.image.version.clone(),
            );
        }
        if let Some(description) = &self.description {
            set(annotations::FLAVOR_DESCRIPTION, description.clone());
        }
        if let Some(allow) = self.allow_privileged_containers {
            set(annotations::ALLOW_PRIVILEGED_CONTAINERS, allow.to_string());
        }
        if let Some(extended) = &self.extended {
            set(annotations::REGION, extended.region.clone());
            if let Some(zone) = &extended.zone {
                set(annotations::ZONE, zone.clone());
            }
        }
        set(annotations::DIMENSION, self.dimension());
        out
    }
}

/// The expanded matrix and the versions it uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorMatrix {
    pub instances: Vec<ResolvedInstance>,
    pub used_kubernetes_versions: KubernetesVersionRegistry,
    pub used_machine_images: MachineImageRegistry,
}

impl FlavorMatrix {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Settings that apply to every flavor of an expansion.
#[derive(Debug, Clone)]
pub struct ExpansionOptions {
    /// Global default for keeping only the newest patch per minor.
    pub filter_patch_versions: bool,

    /// Prefix of generated extended instance names.
    pub shoot_prefix: String,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            filter_patch_versions: false,
            shoot_prefix: DEFAULT_SHOOT_PREFIX.to_string(),
        }
    }
}

/// Expands base flavors, using the provider name as catalog reference.
pub async fn expand_flavors(
    specs: &[FlavorSpec],
    catalogs: &dyn VersionCatalogProvider,
    options: &ExpansionOptions,
) -> FlavorResult<FlavorMatrix> {
    FlavorExpander::new(catalogs, options.clone()).expand(specs).await
}

/// Expands extended flavors, using the cloud profile as catalog reference.
pub async fn expand_extended_flavors(
    specs: &[ExtendedFlavorSpec],
    catalogs: &dyn VersionCatalogProvider,
    options: &ExpansionOptions,
) -> FlavorResult<FlavorMatrix> {
    FlavorExpander::new(catalogs, options.clone())
        .expand_extended(specs)
        .await
}

/// Expands flavors against catalogs from a [`VersionCatalogProvider`].
pub struct FlavorExpander<'a> {
    catalogs: &'a dyn VersionCatalogProvider,
    resolver: VersionResolver,
    options: ExpansionOptions,
}

impl<'a> FlavorExpander<'a> {
    pub fn new(catalogs: &'a dyn VersionCatalogProvider, options: ExpansionOptions) -> Self {
        Self {
            catalogs,
            resolver: VersionResolver::new(options.filter_patch_versions),
            options,
        }
    }

    /// Evaluates version expiration at `now`.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.resolver = self.resolver.at(now);
        self
    }

    /// Validates and expands base flavors.
    ///
    /// # Errors
    ///
    /// Returns [`FlavorError::Validation`] with every violation if any flavor
    /// is invalid; no partial matrix is produced.
    pub async fn expand(&self, specs: &[FlavorSpec]) -> FlavorResult<FlavorMatrix> {
        validate_flavors(specs)?;

        let mut catalogs = CatalogCache::new(self.catalogs);
        let mut matrix = FlavorMatrix::default();
        for (i, spec) in specs.iter().enumerate() {
            let catalog = catalogs.get(spec.provider.as_str()).await?;
            self.expand_one(spec, None, catalog, &format!("flavors[{i}]"), &mut matrix)?;
        }

        info!(
            "Expanded {} flavors into {} instances",
            specs.len(),
            matrix.len()
        );
        Ok(matrix)
    }

    /// Validates and expands extended flavors.
    pub async fn expand_extended(
        &self,
        specs: &[ExtendedFlavorSpec],
    ) -> FlavorResult<FlavorMatrix> {
        validate_extended_flavors(specs)?;

        let mut catalogs = CatalogCache::new(self.catalogs);
        let mut matrix = FlavorMatrix::default();
        for (i, spec) in specs.iter().enumerate() {
            let catalog = catalogs.get(&spec.config.cloudprofile).await?;
            self.expand_one(
                &spec.flavor,
                Some(&spec.config),
                catalog,
                &format!("extendedFlavors[{i}]"),
                &mut matrix,
            )?;
        }

        info!(
            "Expanded {} extended flavors into {} instances",
            specs.len(),
            matrix.len()
        );
        Ok(matrix)
    }

    fn expand_one(
        &self,
        spec: &FlavorSpec,
        extended: Option<&ExtendedConfig>,
        catalog: &VersionCatalog,
        path: &str,
        matrix: &mut FlavorMatrix,
    ) -> FlavorResult<()> {
        let versions = self
            .resolver
            .kubernetes_versions(&catalog.kubernetes, &spec.kubernetes)
            .map_err(|source| FlavorError::Resolution {
                path: format!("{path}.kubernetes"),
                source,
            })?;
        debug!(
            provider = %spec.provider,
            "Resolved {} kubernetes versions for {}",
            versions.len(),
            path
        );

        // A flavor without worker groups yields a single worker-less instance.
        let groups: Vec<Vec<(WorkerPool, ExpirableVersion)>> = match &spec.workers {
            None => vec![Vec::new()],
            Some(groups) => groups
                .iter()
                .enumerate()
                .map(|(g, group)| {
                    group
                        .worker_pools
                        .iter()
                        .enumerate()
                        .map(|(p, pool)| {
                            self.resolve_pool(
                                pool,
                                catalog,
                                &format!("{path}.workers[{g}].workerPools[{p}]"),
                            )
                        })
                        .collect::<FlavorResult<Vec<_>>>()
                })
                .collect::<FlavorResult<Vec<_>>>()?,
        };

        for version in versions {
            matrix
                .used_kubernetes_versions
                .add(&spec.provider, &version);

            for workers in &groups {
                for (pool, image_version) in workers {
                    matrix.used_machine_images.add(
                        &spec.provider,
                        &pool.machine.image.name,
                        image_version,
                        pool.architecture(),
                    );
                }

                matrix.instances.push(ResolvedInstance {
                    provider: spec.provider.clone(),
                    kubernetes_version: version.clone(),
                    workers: workers.iter().map(|(pool, _)| pool.clone()).collect(),
                    annotations: spec.annotations.clone(),
                    additional_locations: spec.additional_locations.clone(),
                    description: spec.description.clone(),
                    allow_privileged_containers: spec.allow_privileged_containers,
                    extended: extended.map(|config| {
                        ExtendedInstance::from_config(config, &self.options.shoot_prefix)
                    }),
                });
            }
        }
        Ok(())
    }

    fn resolve_pool(
        &self,
        pool: &WorkerPool,
        catalog: &VersionCatalog,
        path: &str,
    ) -> FlavorResult<(WorkerPool, ExpirableVersion)> {
        let architecture = pool.architecture().to_string();
        let image = &pool.machine.image;
        let version = self
            .resolver
            .machine_image_version(
                &catalog.machine_images,
                &image.name,
                &image.version,
                &architecture,
            )
            .map_err(|source| FlavorError::Resolution {
                path: format!("{path}.machine.image"),
                source,
            })?;

        let mut resolved = pool.clone();
        resolved.machine.architecture = Some(architecture);
        resolved.machine.image.version = version.version.clone();
        Ok((resolved, version))
    }
}

/// Fetches each catalog at most once per expansion.
struct CatalogCache<'a> {
    provider: &'a dyn VersionCatalogProvider,
    catalogs: HashMap<String, VersionCatalog>,
}

impl<'a> CatalogCache<'a> {
    fn new(provider: &'a dyn VersionCatalogProvider) -> Self {
        Self {
            provider,
            catalogs: HashMap::new(),
        }
    }

    async fn get(&mut self, reference: &str) -> FlavorResult<&VersionCatalog> {
        if !self.catalogs.contains_key(reference) {
            debug!("Fetching catalog {}", reference);
            let catalog = self.provider.catalog(reference).await?;
            self.catalogs.insert(reference.to_string(), catalog);
        }
        self.catalogs
            .get(reference)
            .ok_or_else(|| CatalogError::NotFound(reference.to_string()).into())
    }
}

/// Random string of lowercase letters and digits.
pub(crate) fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
