//! Flavor validation.
//!
//! Validation is not fail-fast: every violation across every flavor is
//! collected into one [`ValidationErrors`] value, each tagged with the field
//! path it refers to, e.g. `flavors[0].workers[1].workerPools[0].machine.architecture`.

use std::fmt;

use super::{ALLOWED_ARCHITECTURES, ExtendedConfig, ExtendedFlavorSpec, FlavorSpec, WorkerPool};

/// A single violation at a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    fn required(path: impl Into<String>) -> Self {
        Self::new(path, "value has to be defined")
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All violations found while validating a set of flavors.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", render(.0))]
pub struct ValidationErrors(Vec<FieldError>);

fn render(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ValidationErrors {
    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// Returns `Ok(())` if nothing was collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

/// Validates base flavors, reporting paths as `flavors[i]`.
pub fn validate_flavors(specs: &[FlavorSpec]) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    for (i, spec) in specs.iter().enumerate() {
        validate_flavor(spec, &format!("flavors[{i}]"), &mut errors);
    }
    errors.into_result()
}

/// Validates extended flavors, reporting paths as `extendedFlavors[i]`.
pub fn validate_extended_flavors(specs: &[ExtendedFlavorSpec]) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    for (i, spec) in specs.iter().enumerate() {
        let path = format!("extendedFlavors[{i}]");
        validate_flavor(&spec.flavor, &path, &mut errors);
        validate_extended_config(&spec.config, &path, &mut errors);
    }
    errors.into_result()
}

/// Validates one flavor and appends violations to `errors`.
pub fn validate_flavor(spec: &FlavorSpec, path: &str, errors: &mut ValidationErrors) {
    if spec.provider.as_str().trim().is_empty() {
        errors.push(FieldError::required(format!("{path}.provider")));
    }

    let selector = &spec.kubernetes;
    let has_versions = selector.versions.as_ref().is_some_and(|v| !v.is_empty());
    let has_pattern = selector
        .pattern
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if !has_versions && !has_pattern {
        errors.push(FieldError::new(
            format!("{path}.kubernetes"),
            "Kubernetes versions or a pattern has to be defined",
        ));
    }
    for (i, version) in selector.versions.iter().flatten().enumerate() {
        if let Err(e) = version.parse() {
            errors.push(FieldError::new(
                format!("{path}.kubernetes.versions[{i}]"),
                e.to_string(),
            ));
        }
    }

    let Some(groups) = &spec.workers else {
        return;
    };
    if groups.is_empty() {
        errors.push(FieldError::new(
            format!("{path}.workers"),
            "at least one worker group has to be defined",
        ));
    }
    for (g, group) in groups.iter().enumerate() {
        let group_path = format!("{path}.workers[{g}]");
        if group.worker_pools.is_empty() {
            errors.push(FieldError::new(
                format!("{group_path}.workerPools"),
                "at least one worker pool has to be defined",
            ));
        }
        for (p, pool) in group.worker_pools.iter().enumerate() {
            validate_worker_pool(pool, &format!("{group_path}.workerPools[{p}]"), errors);
        }
    }
}

fn validate_worker_pool(pool: &WorkerPool, path: &str, errors: &mut ValidationErrors) {
    if pool.name.trim().is_empty() {
        errors.push(FieldError::required(format!("{path}.name")));
    }
    if pool.machine.machine_type.trim().is_empty() {
        errors.push(FieldError::required(format!("{path}.machine.type")));
    }
    if pool.machine.image.name.trim().is_empty() {
        errors.push(FieldError::required(format!("{path}.machine.image.name")));
    }
    if let Some(arch) = &pool.machine.architecture
        && !ALLOWED_ARCHITECTURES.contains(&arch.as_str())
    {
        errors.push(FieldError::new(
            format!("{path}.machine.architecture"),
            format!(
                "unsupported architecture {arch:?}, expected one of {}",
                ALLOWED_ARCHITECTURES.join(", ")
            ),
        ));
    }
}

fn validate_extended_config(config: &ExtendedConfig, path: &str, errors: &mut ValidationErrors) {
    let required = [
        ("cloudprofile", &config.cloudprofile),
        ("projectName", &config.project_name),
        ("region", &config.region),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            errors.push(FieldError::required(format!("{path}.{field}")));
        }
    }

    let secret = config.secret_binding.as_deref().is_some_and(|s| !s.is_empty());
    let credentials = config
        .credentials_binding
        .as_deref()
        .is_some_and(|s| !s.is_empty());
    match (secret, credentials) {
        (false, false) => errors.push(FieldError::new(
            format!("{path}.secretBinding"),
            "one of secretBinding or credentialsBinding has to be defined",
        )),
        (true, true) => errors.push(FieldError::new(
            format!("{path}.credentialsBinding"),
            "only one of secretBinding or credentialsBinding may be defined",
        )),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{CloudProvider, Machine, MachineImage, WorkerGroup};
    use crate::version::VersionSelector;

    fn pool(name: &str, arch: Option<&str>) -> WorkerPool {
        WorkerPool {
            name: name.to_string(),
            machine: Machine {
                machine_type: "m5.large".to_string(),
                image: MachineImage::latest("gardenlinux"),
                architecture: arch.map(str::to_string),
            },
            minimum: 1,
            maximum: 2,
        }
    }

    fn flavor() -> FlavorSpec {
        FlavorSpec {
            provider: CloudProvider::new("aws"),
            kubernetes: VersionSelector::pattern("latest"),
            ..FlavorSpec::default()
        }
    }

    fn paths(errors: &ValidationErrors) -> Vec<&str> {
        errors.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_valid_flavor() {
        let mut spec = flavor();
        spec.workers = Some(vec![WorkerGroup {
            worker_pools: vec![pool("wp1", Some("arm64"))],
        }]);
        assert!(validate_flavors(&[spec]).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let missing_provider = FlavorSpec {
            provider: CloudProvider::new(""),
            kubernetes: VersionSelector::default(),
            ..FlavorSpec::default()
        };
        let mut bad_pools = flavor();
        bad_pools.workers = Some(vec![
            WorkerGroup {
                worker_pools: vec![pool("wp1", None)],
            },
            WorkerGroup {
                worker_pools: vec![pool("", Some("s390x"))],
            },
            WorkerGroup {
                worker_pools: vec![],
            },
        ]);

        let errors = validate_flavors(&[missing_provider, bad_pools]).unwrap_err();
        assert_eq!(
            paths(&errors),
            [
                "flavors[0].provider",
                "flavors[0].kubernetes",
                "flavors[1].workers[1].workerPools[0].name",
                "flavors[1].workers[1].workerPools[0].machine.architecture",
                "flavors[1].workers[2].workerPools",
            ]
        );
        assert!(errors.to_string().contains("flavors[0].provider: value has to be defined"));
    }

    #[test]
    fn test_invalid_explicit_version() {
        let mut spec = flavor();
        spec.kubernetes = VersionSelector::versions(["1.15.2", "one.two"]);
        let errors = validate_flavors(&[spec]).unwrap_err();
        assert_eq!(paths(&errors), ["flavors[0].kubernetes.versions[1]"]);
    }

    #[test]
    fn test_empty_worker_list() {
        let mut spec = flavor();
        spec.workers = Some(vec![]);
        let errors = validate_flavors(&[spec]).unwrap_err();
        assert_eq!(paths(&errors), ["flavors[0].workers"]);
    }

    #[test]
    fn test_extended_flavor_requirements() {
        let spec = ExtendedFlavorSpec {
            flavor: flavor(),
            config: ExtendedConfig {
                cloudprofile: "aws".to_string(),
                secret_binding: Some("sb".to_string()),
                credentials_binding: Some("cb".to_string()),
                ..ExtendedConfig::default()
            },
        };
        let errors = validate_extended_flavors(&[spec]).unwrap_err();
        assert_eq!(
            paths(&errors),
            [
                "extendedFlavors[0].projectName",
                "extendedFlavors[0].region",
                "extendedFlavors[0].credentialsBinding",
            ]
        );
    }

    #[test]
    fn test_extended_flavor_needs_a_binding() {
        let spec = ExtendedFlavorSpec {
            flavor: flavor(),
            config: ExtendedConfig {
                cloudprofile: "aws".to_string(),
                project_name: "it".to_string(),
                region: "eu-west-1".to_string(),
                ..ExtendedConfig::default()
            },
        };
        let errors = validate_extended_flavors(&[spec]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(paths(&errors), ["extendedFlavors[0].secretBinding"]);
    }
}
