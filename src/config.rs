//! Configuration loading and schema definitions for testmatrix.
//!
//! The configuration is a TOML document holding the runner and executor
//! settings, the flavors to expand and static version catalogs. See
//! [`schema`] for the individual sections.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
///
/// # Example
///
/// ```no_run
/// use testmatrix::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testmatrix.toml"))?;
/// println!("Flake attempts: {}", config.runner.flake_attempts);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use testmatrix::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [runner]
///     flake_attempts = 2
/// "#)?;
///
/// assert_eq!(config.runner.flake_attempts, 2);
/// assert_eq!(config.runner.run_timeout_secs, 3600);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
