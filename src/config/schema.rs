//! Configuration schema definitions for testmatrix.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunnerConfig              - Retries, timeouts, naming
//! ├── ExecutorSettings          - Serial/parallel dispatch and backoff
//! ├── flavors: [FlavorSpec]     - Base flavors (camelCase keys)
//! ├── extended_flavors: [...]   - Flavors with project settings
//! └── catalogs: {ref → VersionCatalog}
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::catalog::{StaticCatalogProvider, VersionCatalog};
use crate::executor::ExecutorConfig;
use crate::flavor::{DEFAULT_SHOOT_PREFIX, ExpansionOptions, ExtendedFlavorSpec, FlavorSpec};
use crate::orchestrator::OrchestratorConfig;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [runner]
/// flake_attempts = 2
///
/// [executor]
/// backoff_bucket = 2
/// backoff_period_secs = 30
///
/// [[flavors]]
/// provider = "aws"
/// kubernetes = { pattern = "latest" }
///
/// [catalogs.aws]
/// kubernetes = [{ version = "1.15.2" }]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub flavors: Vec<FlavorSpec>,

    #[serde(default)]
    pub extended_flavors: Vec<ExtendedFlavorSpec>,

    /// Static version catalogs keyed by provider name or cloud profile.
    #[serde(default)]
    pub catalogs: BTreeMap<String, VersionCatalog>,
}

impl Config {
    /// Catalog provider serving the `[catalogs]` section.
    pub fn catalog_provider(&self) -> StaticCatalogProvider {
        StaticCatalogProvider::new(self.catalogs.clone())
    }

    pub fn expansion_options(&self) -> ExpansionOptions {
        ExpansionOptions {
            filter_patch_versions: self.runner.filter_patch_versions,
            shoot_prefix: self.runner.shoot_prefix.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            flake_attempts: self.runner.flake_attempts,
            run_timeout: Duration::from_secs(self.runner.run_timeout_secs),
        }
    }
}

/// Retry, timeout and naming settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `flake_attempts` | 0 |
/// | `run_timeout_secs` | 3600 |
/// | `filter_patch_versions` | false |
/// | `shoot_prefix` | `"tm-"` |
/// | `testrun_prefix` | `"tm-run-"` |
/// | `command` | None |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Retries granted to a failing testrun.
    #[serde(default)]
    pub flake_attempts: u32,

    /// Time a single attempt may take.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Keep only the newest patch of every minor version by default.
    #[serde(default)]
    pub filter_patch_versions: bool,

    #[serde(default = "default_shoot_prefix")]
    pub shoot_prefix: String,

    #[serde(default = "default_testrun_prefix")]
    pub testrun_prefix: String,

    /// Command executing a single testrun, split with shell quoting rules.
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            flake_attempts: 0,
            run_timeout_secs: default_run_timeout(),
            filter_patch_versions: false,
            shoot_prefix: default_shoot_prefix(),
            testrun_prefix: default_testrun_prefix(),
            command: None,
        }
    }
}

fn default_run_timeout() -> u64 {
    3600
}

fn default_shoot_prefix() -> String {
    DEFAULT_SHOOT_PREFIX.to_string()
}

fn default_testrun_prefix() -> String {
    "tm-run-".to_string()
}

/// Dispatch settings, converted into an [`ExecutorConfig`].
///
/// Values are signed so that negative input reaches the executor's own
/// validation instead of failing as a parse error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub serial: bool,

    #[serde(default)]
    pub backoff_bucket: i64,

    #[serde(default)]
    pub backoff_period_secs: i64,
}

impl ExecutorSettings {
    /// Periods beyond the range of [`TimeDelta`] saturate towards their sign.
    pub fn to_executor_config(&self) -> ExecutorConfig {
        let saturated = if self.backoff_period_secs < 0 {
            TimeDelta::MIN
        } else {
            TimeDelta::MAX
        };
        ExecutorConfig {
            serial: self.serial,
            backoff_bucket: self.backoff_bucket,
            backoff_period: TimeDelta::try_seconds(self.backoff_period_secs).unwrap_or(saturated),
        }
    }
}
