//! Execution backend that runs every testrun as a local command.
//!
//! The command is split with shell quoting rules and started once per
//! testrun. The testrun is described to the child through the environment:
//!
//! | Variable | Content |
//! |----------|---------|
//! | `TESTMATRIX_TESTRUN_NAME` | Name of the testrun |
//! | `TESTMATRIX_DIMENSION` | `provider/k8sVersion/os[/description]` |
//! | `TESTMATRIX_TESTRUN` | The full testrun as JSON |
//!
//! Exit code 0 maps to [`RunPhase::Success`], any other exit to
//! [`RunPhase::Failure`]. A command still running at the deadline is killed
//! and reported as [`RunPhase::Timeout`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{BackendError, BackendResult, ExecutionBackend, RunHandle, RunPhase, Testrun};
use crate::annotations;

pub struct ShellBackend {
    command: String,
    working_dir: Option<PathBuf>,
    running: Mutex<HashMap<String, Child>>,
}

impl ShellBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn command_parts(&self) -> Vec<String> {
        shell_words::split(&self.command).unwrap_or_else(|_| vec![self.command.clone()])
    }
}

#[async_trait]
impl ExecutionBackend for ShellBackend {
    async fn submit(&self, testrun: &Testrun) -> BackendResult<RunHandle> {
        let parts = self.command_parts();
        let Some((program, args)) = parts.split_first() else {
            return Err(BackendError::Submit {
                name: testrun.name.clone(),
                message: "command is empty".to_string(),
            });
        };

        let json = serde_json::to_string(testrun).map_err(|e| BackendError::Other(e.into()))?;
        let dimension = testrun
            .annotations
            .get(annotations::DIMENSION)
            .cloned()
            .unwrap_or_default();

        debug!("Running {:?} for testrun {}", parts, testrun.name);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("TESTMATRIX_TESTRUN_NAME", &testrun.name)
            .env("TESTMATRIX_DIMENSION", dimension)
            .env("TESTMATRIX_TESTRUN", json)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| BackendError::Submit {
            name: testrun.name.clone(),
            message: e.to_string(),
        })?;

        self.running.lock().await.insert(testrun.name.clone(), child);
        Ok(RunHandle {
            id: testrun.name.clone(),
        })
    }

    async fn await_completion(
        &self,
        handle: &RunHandle,
        deadline: Instant,
    ) -> BackendResult<RunPhase> {
        let mut child = self
            .running
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| BackendError::Other(anyhow::anyhow!("unknown testrun {}", handle.id)))?;

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(RunPhase::Success),
            Ok(Ok(status)) => {
                debug!("Testrun {} exited with {}", handle.id, status);
                Ok(RunPhase::Failure)
            }
            Ok(Err(e)) => Err(BackendError::Other(e.into())),
            Err(_) => {
                warn!("Testrun {} hit its deadline, killing it", handle.id);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill testrun {}: {}", handle.id, e);
                }
                Ok(RunPhase::Timeout)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn run(backend: &ShellBackend, timeout: Duration) -> BackendResult<RunPhase> {
        let testrun = Testrun::new("tm-run-test");
        let handle = backend.submit(&testrun).await?;
        backend
            .await_completion(&handle, Instant::now() + timeout)
            .await
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_phases() {
        let ok = ShellBackend::new("true");
        assert_eq!(run(&ok, Duration::from_secs(10)).await.unwrap(), RunPhase::Success);

        let failing = ShellBackend::new("false");
        assert_eq!(
            run(&failing, Duration::from_secs(10)).await.unwrap(),
            RunPhase::Failure
        );
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let backend = ShellBackend::new(r#"sh -c 'test "$TESTMATRIX_TESTRUN_NAME" = tm-run-test'"#);
        assert_eq!(
            run(&backend, Duration::from_secs(10)).await.unwrap(),
            RunPhase::Success
        );
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let backend =
            ShellBackend::new("test -f marker").with_working_dir(dir.path().to_path_buf());
        assert_eq!(
            run(&backend, Duration::from_secs(10)).await.unwrap(),
            RunPhase::Success
        );
    }

    #[tokio::test]
    async fn test_deadline_kills_command() {
        let backend = ShellBackend::new("sleep 30");
        assert_eq!(
            run(&backend, Duration::from_millis(100)).await.unwrap(),
            RunPhase::Timeout
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let backend = ShellBackend::new("testmatrix-no-such-program");
        let err = run(&backend, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::Submit { .. }));

        let empty = ShellBackend::new("");
        assert!(run(&empty, Duration::from_secs(1)).await.is_err());
    }
}
