//! testmatrix: test matrix expansion and flake-retrying parallel execution.
//!
//! This crate turns abstract flavor descriptions ("which cluster
//! configurations to test") into a concrete matrix of test instances, then
//! runs those instances concurrently with bounded retries against an
//! external execution backend.
//!
//! # Architecture
//!
//! The main components are, leaves first:
//!
//! - **Version**: Resolve version selectors and "latest" machine images
//! - **Catalog**: Supply the versions a provider offers
//! - **Flavor**: Validate and expand flavors into a [`FlavorMatrix`]
//! - **Executor**: Drain a task queue with serial or bucketed backoff
//! - **Orchestrator**: Submit, await and retry testruns on the executor
//!
//! # Example
//!
//! ```no_run
//! use testmatrix::config::load_config;
//! use testmatrix::flavor::expand_flavors;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testmatrix.toml"))?;
//!     let catalogs = config.catalog_provider();
//!     let matrix = expand_flavors(&config.flavors, &catalogs, &config.expansion_options()).await?;
//!     println!("{} instances", matrix.len());
//!     Ok(())
//! }
//! ```

pub mod annotations;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod flavor;
pub mod orchestrator;
pub mod report;
pub mod version;

// Re-export commonly used types
pub use catalog::{StaticCatalogProvider, VersionCatalog, VersionCatalogProvider};
pub use config::{Config, load_config};
pub use executor::{Executor, ExecutorConfig, ExecutorHandle, Task};
pub use flavor::{FlavorError, FlavorMatrix, FlavorSpec, ResolvedInstance};
pub use orchestrator::{ExecutionBackend, Orchestrator, Rerenderer, RunReport, Testrun};
pub use version::{ExpirableVersion, VersionResolver, VersionSelector};
