//! Interfaces to the systems that execute and regenerate testruns.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::annotations;
use crate::flavor::{ResolvedInstance, random_suffix};

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by an [`ExecutionBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to submit testrun {name}: {message}")]
    Submit { name: String, message: String },

    /// The deadline passed before the testrun reached a terminal phase.
    #[error("Timed out waiting for testrun {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failure to produce a fresh testrun for a retry.
#[derive(Debug, thiserror::Error)]
#[error("Failed to rerender testrun {name}: {message}")]
pub struct RerenderError {
    pub name: String,
    pub message: String,
}

/// A test execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Testrun {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<ResolvedInstance>,
}

impl Testrun {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
            instance: None,
        }
    }

    /// Creates a testrun for a matrix cell, named `<prefix><random>` and
    /// annotated with the cell's metadata.
    pub fn for_instance(instance: ResolvedInstance, prefix: &str) -> Self {
        let mut annotations = instance.metadata_annotations();
        annotations.insert(annotations::RETRIES.to_string(), "0".to_string());
        Self {
            name: format!("{prefix}{}", random_suffix(5)),
            annotations,
            instance: Some(instance),
        }
    }

    /// Number of retries recorded on this testrun.
    pub fn retries(&self) -> u32 {
        self.annotations
            .get(annotations::RETRIES)
            .and_then(|r| r.parse().ok())
            .unwrap_or(0)
    }
}

/// Reference to a submitted testrun.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub id: String,
}

/// Terminal phase of a testrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Success,
    Failure,
    Error,
    Timeout,
}

impl RunPhase {
    pub fn is_success(self) -> bool {
        self == RunPhase::Success
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RunPhase::Success => "Success",
            RunPhase::Failure => "Failure",
            RunPhase::Error => "Error",
            RunPhase::Timeout => "Timeout",
        };
        f.write_str(phase)
    }
}

/// Executes testruns.
///
/// `await_completion` must return by `deadline`, either with a terminal
/// phase or with [`BackendError::Timeout`].
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, testrun: &Testrun) -> BackendResult<RunHandle>;

    async fn await_completion(&self, handle: &RunHandle, deadline: Instant)
    -> BackendResult<RunPhase>;
}

/// Produces a fresh testrun with the same parameters as a failed one.
#[async_trait]
pub trait Rerenderer: Send + Sync {
    async fn rerender(&self, previous: &Testrun) -> Result<Testrun, RerenderError>;
}

/// Rerenderer that keeps the instance and annotations and only assigns a
/// new name. Instances of extended flavors get a new attempt name derived
/// from their instance name.
#[derive(Debug, Clone)]
pub struct RenameRerenderer {
    prefix: String,
}

impl RenameRerenderer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Rerenderer for RenameRerenderer {
    async fn rerender(&self, previous: &Testrun) -> Result<Testrun, RerenderError> {
        let mut next = previous.clone();
        let attempt = match next.instance.as_mut().and_then(|i| i.extended.as_mut()) {
            Some(extended) => {
                extended.name = extended.new_attempt_name();
                extended.name.clone()
            }
            None => random_suffix(5),
        };
        next.name = format!("{}{}", self.prefix, attempt);
        Ok(next)
    }
}
