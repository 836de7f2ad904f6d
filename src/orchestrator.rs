//! Bounded-retry orchestration of testruns.
//!
//! Every testrun occupies one slot in a [`RunAttempt`] arena. A slot is
//! driven by exactly one task on the [`Executor`] at a time:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   Pending ──► Executing ──► Succeeded                     │
//!                   │                                       │
//!                   ├── attempt == flake_attempts ──► ExhaustedRetries
//!                   │                                       │
//!                   └──► Rerendering ──ok──► (new task) ────┘
//!                             │
//!                             └──err──► InfraError
//! ```
//!
//! On a retry the slot is replaced by a new [`RunAttempt`] that points back
//! at the attempt it supersedes, and a new task for the slot is enqueued on
//! the running executor. Failures stay scoped to their slot and are collected
//! into the final [`RunReport`].
//!
//! # Example
//!
//! ```no_run
//! use testmatrix::executor::{Executor, ExecutorConfig};
//! use testmatrix::orchestrator::{
//!     ExecutionBackend, Orchestrator, OrchestratorConfig, RenameRerenderer, Testrun,
//! };
//!
//! async fn run(backend: impl ExecutionBackend + 'static) -> i32 {
//!     let executor = Executor::new(ExecutorConfig::default()).unwrap();
//!     let orchestrator = Orchestrator::new(
//!         backend,
//!         RenameRerenderer::new("tm-run-"),
//!         OrchestratorConfig::default(),
//!     );
//!
//!     let report = orchestrator
//!         .run(&executor, vec![Testrun::new("tm-run-abcde")])
//!         .await;
//!     report.exit_code()
//! }
//! ```

pub mod backend;
pub mod events;
pub mod shell;

pub use backend::{
    BackendError, BackendResult, ExecutionBackend, RenameRerenderer, RerenderError, Rerenderer,
    RunHandle, RunPhase, Testrun,
};
pub use events::{RunEvent, RunEvents};
pub use shell::ShellBackend;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::annotations;
use crate::executor::{Executor, ExecutorHandle, Task};

/// Index of a slot in the attempt arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptState {
    Pending,
    Executing,
    Rerendering,
    Succeeded,
    ExhaustedRetries,
    InfraError,
}

/// One attempt at executing a testrun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAttempt {
    pub testrun: Testrun,

    /// Zero-based retry count, never above the configured flake attempts.
    pub attempt: u32,

    /// Name of the testrun this attempt supersedes.
    pub previous_attempt: Option<String>,

    pub phase: Option<RunPhase>,
    pub error: Option<String>,
    pub state: AttemptState,
}

impl RunAttempt {
    fn first(testrun: Testrun) -> Self {
        Self {
            testrun,
            attempt: 0,
            previous_attempt: None,
            phase: None,
            error: None,
            state: AttemptState::Pending,
        }
    }

    /// Succeeded only after at least one retry.
    pub fn is_flaky(&self) -> bool {
        self.state == AttemptState::Succeeded && self.attempt > 0
    }
}

/// Retry and timeout settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Maximum number of retries after a failing attempt.
    pub flake_attempts: u32,

    /// Time a single attempt may take before the backend gives up.
    pub run_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            flake_attempts: 0,
            run_timeout: Duration::from_secs(3600),
        }
    }
}

struct SlotArena {
    slots: Mutex<Vec<RunAttempt>>,
}

impl SlotArena {
    fn new(testruns: Vec<Testrun>) -> Self {
        Self {
            slots: Mutex::new(testruns.into_iter().map(RunAttempt::first).collect()),
        }
    }

    fn with<T>(&self, slot: SlotId, f: impl FnOnce(&mut RunAttempt) -> T) -> T {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut slots[slot.0])
    }

    fn replace(&self, slot: SlotId, attempt: RunAttempt) {
        self.with(slot, |current| *current = attempt);
    }

    fn snapshot(&self) -> Vec<RunAttempt> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Everything a slot task needs, shared by all tasks of one run.
struct RunContext<B, R> {
    backend: Arc<B>,
    rerenderer: Arc<R>,
    config: OrchestratorConfig,
    events: RunEvents,
    group: Uuid,
    slots: SlotArena,
    executor: ExecutorHandle,
}

impl<B, R> RunContext<B, R>
where
    B: ExecutionBackend + 'static,
    R: Rerenderer + 'static,
{
    fn slot_task(self: &Arc<Self>, slot: SlotId) -> Task {
        let (name, attempt) = self.slots.with(slot, |a| (a.testrun.name.clone(), a.attempt));
        let span = info_span!("testrun", slot = %slot, name = %name, attempt);
        Task::new(name, Arc::clone(self).run_attempt(slot).instrument(span))
    }

    fn run_attempt(self: Arc<Self>, slot: SlotId) -> BoxFuture<'static, ()> {
        async move {
            let (testrun, attempt) = self.slots.with(slot, |a| {
                a.state = AttemptState::Executing;
                (a.testrun.clone(), a.attempt)
            });

            self.events.emit(&RunEvent {
                group: self.group,
                slot,
                testrun: testrun.name.clone(),
                attempt,
            });
            info!("Executing testrun {}", testrun.name);

            let (phase, message) = match self.execute(&testrun).await {
                Ok(RunPhase::Success) => {
                    info!("Testrun {} succeeded", testrun.name);
                    self.slots.with(slot, |a| {
                        a.phase = Some(RunPhase::Success);
                        a.state = AttemptState::Succeeded;
                    });
                    return;
                }
                Ok(phase) => (
                    Some(phase),
                    format!("testrun {} finished with phase {}", testrun.name, phase),
                ),
                Err(e) => (None, e.to_string()),
            };

            if attempt >= self.config.flake_attempts {
                warn!(
                    "Testrun {} failed after {} retries: {}",
                    testrun.name, attempt, message
                );
                self.slots.with(slot, |a| {
                    a.phase = phase;
                    a.error = Some(message);
                    a.state = AttemptState::ExhaustedRetries;
                });
                return;
            }

            info!(
                "Testrun {} failed, retrying ({}/{}): {}",
                testrun.name,
                attempt + 1,
                self.config.flake_attempts,
                message
            );
            self.slots.with(slot, |a| {
                a.phase = phase;
                a.error = Some(message);
                a.state = AttemptState::Rerendering;
            });

            let mut next = match self.rerenderer.rerender(&testrun).await {
                Ok(next) => next,
                Err(e) => {
                    error!("Unable to rerender testrun {}: {}", testrun.name, e);
                    self.slots.with(slot, |a| {
                        a.error = Some(e.to_string());
                        a.state = AttemptState::InfraError;
                    });
                    return;
                }
            };

            next.annotations
                .insert(annotations::RETRIES.to_string(), (attempt + 1).to_string());
            next.annotations
                .insert(annotations::PREVIOUS_ATTEMPT.to_string(), testrun.name.clone());
            self.slots.replace(
                slot,
                RunAttempt {
                    testrun: next,
                    attempt: attempt + 1,
                    previous_attempt: Some(testrun.name),
                    phase: None,
                    error: None,
                    state: AttemptState::Pending,
                },
            );
            self.executor.add_item(self.slot_task(slot));
        }
        .boxed()
    }

    async fn execute(&self, testrun: &Testrun) -> BackendResult<RunPhase> {
        let handle = self.backend.submit(testrun).await?;
        let deadline = tokio::time::Instant::now() + self.config.run_timeout;
        self.backend.await_completion(&handle, deadline).await
    }
}

/// Drives testruns through submit, await, and retry on an [`Executor`].
pub struct Orchestrator<B, R> {
    backend: Arc<B>,
    rerenderer: Arc<R>,
    config: OrchestratorConfig,
    events: RunEvents,
}

impl<B, R> Orchestrator<B, R>
where
    B: ExecutionBackend + 'static,
    R: Rerenderer + 'static,
{
    pub fn new(backend: B, rerenderer: R, config: OrchestratorConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            rerenderer: Arc::new(rerenderer),
            config,
            events: RunEvents::new(),
        }
    }

    /// Event registry; subscribe before calling [`run`](Self::run).
    pub fn events(&self) -> &RunEvents {
        &self.events
    }

    /// Runs every testrun to a terminal state and reports the outcome.
    ///
    /// All attempts are stamped with a fresh execution group id. The
    /// executor is drained completely, including tasks queued by other
    /// callers.
    pub async fn run(&self, executor: &Executor, testruns: Vec<Testrun>) -> RunReport {
        let start = std::time::Instant::now();
        let group = Uuid::new_v4();

        let testruns: Vec<Testrun> = testruns
            .into_iter()
            .map(|mut tr| {
                tr.annotations
                    .insert(annotations::EXECUTION_GROUP.to_string(), group.to_string());
                tr
            })
            .collect();
        let count = testruns.len();

        let context = Arc::new(RunContext {
            backend: Arc::clone(&self.backend),
            rerenderer: Arc::clone(&self.rerenderer),
            config: self.config.clone(),
            events: self.events.clone(),
            group,
            slots: SlotArena::new(testruns),
            executor: executor.handle(),
        });

        info!("Running {} testruns in execution group {}", count, group);
        for slot in (0..count).map(SlotId) {
            executor.add_item(context.slot_task(slot));
        }
        executor.run().await;

        RunReport::new(group, context.slots.snapshot(), start.elapsed())
    }
}

/// Aggregated outcome of an orchestrated run.
///
/// | Exit code | Meaning |
/// |-----------|---------|
/// | 0 | Every testrun succeeded on its first attempt |
/// | 1 | Some testrun failed or hit an infrastructure error |
/// | 2 | Everything succeeded but some testruns needed retries |
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub group: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub flaky: usize,
    pub infra_errors: usize,
    pub duration: Duration,
    /// Final attempt of every slot, in slot order.
    pub attempts: Vec<RunAttempt>,
}

impl RunReport {
    pub fn new(group: Uuid, attempts: Vec<RunAttempt>, duration: Duration) -> Self {
        let count = |state| attempts.iter().filter(|a| a.state == state).count();
        Self {
            group,
            total: attempts.len(),
            succeeded: count(AttemptState::Succeeded),
            failed: count(AttemptState::ExhaustedRetries),
            infra_errors: count(AttemptState::InfraError),
            flaky: attempts.iter().filter(|a| a.is_flaky()).count(),
            duration,
            attempts,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.infra_errors == 0 && self.succeeded == self.total
    }

    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }

    /// One line per testrun that did not succeed, `None` if all did.
    pub fn errors(&self) -> Option<String> {
        let lines: Vec<String> = self
            .attempts
            .iter()
            .filter(|a| a.state != AttemptState::Succeeded)
            .map(|a| {
                format!(
                    "{}: {}",
                    a.testrun.name,
                    a.error.as_deref().unwrap_or("did not complete")
                )
            })
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}
