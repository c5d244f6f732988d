//! Service supervisor interface and implementations.
//!
//! The updater only needs to stop the agent before touching its binary and
//! start it afterwards. The host backend shells out to `systemctl`; the mock
//! records calls so tests can assert ordering without touching the host.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::signal::Shutdown;

/// Errors from service control.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {action} failed with {status}: {stderr}")]
    CommandFailed {
        action: ServiceAction,
        status: String,
        stderr: String,
    },

    #[error("service {action} timed out after {timeout:?}")]
    Timeout {
        action: ServiceAction,
        timeout: Duration,
    },

    #[error("service {action} cancelled")]
    Cancelled { action: ServiceAction },

    #[error("service {action} failed: {message}")]
    Other { action: ServiceAction, message: String },
}

/// Service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Stop,
    Start,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Start => "start",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control over the host's managed agent service.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Stop the service. Returns promptly once `shutdown` fires.
    async fn stop(&self, shutdown: &Shutdown) -> Result<(), ServiceError>;

    /// Start the service. Returns promptly once `shutdown` fires.
    async fn start(&self, shutdown: &Shutdown) -> Result<(), ServiceError>;
}

/// Host backend driving a systemd unit through `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdServiceController {
    unit: String,
    program: PathBuf,
    stop_timeout: Duration,
    start_timeout: Duration,
}

impl SystemdServiceController {
    pub fn new(unit: impl Into<String>, stop_timeout: Duration, start_timeout: Duration) -> Self {
        Self {
            unit: unit.into(),
            program: PathBuf::from("systemctl"),
            stop_timeout,
            start_timeout,
        }
    }

    /// Use a different supervisor binary with `systemctl`-compatible
    /// `<action> <unit>` arguments.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    async fn run(
        &self,
        action: ServiceAction,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<(), ServiceError> {
        info!(unit = %self.unit, action = %action, "Running service command");

        let mut command = Command::new(&self.program);
        command
            .arg(action.as_str())
            .arg(&self.unit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = command.output();

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, output) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(source)) => {
                    return Err(ServiceError::Spawn {
                        program: self.program.display().to_string(),
                        source,
                    })
                }
                Err(_) => return Err(ServiceError::Timeout { action, timeout }),
            },
            _ = shutdown.triggered() => return Err(ServiceError::Cancelled { action }),
        };

        if !output.status.success() {
            return Err(ServiceError::CommandFailed {
                action,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(unit = %self.unit, action = %action, "Service command succeeded");
        Ok(())
    }
}

#[async_trait]
impl ServiceController for SystemdServiceController {
    async fn stop(&self, shutdown: &Shutdown) -> Result<(), ServiceError> {
        self.run(ServiceAction::Stop, self.stop_timeout, shutdown)
            .await
    }

    async fn start(&self, shutdown: &Shutdown) -> Result<(), ServiceError> {
        self.run(ServiceAction::Start, self.start_timeout, shutdown)
            .await
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Mock service controller for testing.
///
/// Records every call in order and can be told to fail either operation.
#[derive(Default)]
pub struct MockServiceController {
    calls: Mutex<Vec<ServiceAction>>,
    fail_stop: bool,
    fail_start: bool,
    after_stop: Option<Hook>,
    after_start: Option<Hook>,
}

impl MockServiceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every stop.
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    /// Fail every start.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Run `hook` after each successful stop.
    pub fn on_stop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_stop = Some(Box::new(hook));
        self
    }

    /// Run `hook` after each successful start.
    pub fn on_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_start = Some(Box::new(hook));
        self
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<ServiceAction> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, action: ServiceAction) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(action);
        }
    }
}

#[async_trait]
impl ServiceController for MockServiceController {
    async fn stop(&self, shutdown: &Shutdown) -> Result<(), ServiceError> {
        if shutdown.is_triggered() {
            return Err(ServiceError::Cancelled {
                action: ServiceAction::Stop,
            });
        }

        info!("[MOCK] Stopping service");
        self.record(ServiceAction::Stop);

        if self.fail_stop {
            return Err(ServiceError::Other {
                action: ServiceAction::Stop,
                message: "mock configured to fail".to_string(),
            });
        }
        if let Some(hook) = &self.after_stop {
            hook();
        }
        Ok(())
    }

    async fn start(&self, shutdown: &Shutdown) -> Result<(), ServiceError> {
        if shutdown.is_triggered() {
            return Err(ServiceError::Cancelled {
                action: ServiceAction::Start,
            });
        }

        info!("[MOCK] Starting service");
        self.record(ServiceAction::Start);

        if self.fail_start {
            return Err(ServiceError::Other {
                action: ServiceAction::Start,
                message: "mock configured to fail".to_string(),
            });
        }
        if let Some(hook) = &self.after_start {
            hook();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mock_records_order() {
        let mock = MockServiceController::new();
        let shutdown = Shutdown::never();

        mock.stop(&shutdown).await.unwrap();
        mock.start(&shutdown).await.unwrap();

        assert_eq!(mock.calls(), vec![ServiceAction::Stop, ServiceAction::Start]);
    }

    #[tokio::test]
    async fn test_mock_failing_start() {
        let mock = MockServiceController::failing_start();
        let result = mock.start(&Shutdown::never()).await;

        assert!(result.is_err());
        assert_eq!(mock.calls(), vec![ServiceAction::Start]);
    }

    #[tokio::test]
    async fn test_mock_stop_hook_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let mock = MockServiceController::new().on_stop({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        mock.stop(&Shutdown::never()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_cancelled_records_nothing() {
        let (trigger, shutdown) = Shutdown::channel();
        trigger.trigger();

        let mock = MockServiceController::new();
        let err = mock.stop(&shutdown).await.unwrap_err();

        assert!(matches!(err, ServiceError::Cancelled { .. }));
        assert!(mock.calls().is_empty());
    }

    #[cfg(unix)]
    mod systemd {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        const TIMEOUT: Duration = Duration::from_secs(5);

        fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-systemctl");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_systemd_passes_action_and_unit() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let program = script(&dir, &format!("echo \"$1 $2\" >> {}", log.display()));

            let controller = SystemdServiceController::new("ghost-agent.service", TIMEOUT, TIMEOUT)
                .with_program(program);
            let shutdown = Shutdown::never();

            controller.stop(&shutdown).await.unwrap();
            controller.start(&shutdown).await.unwrap();

            let calls = std::fs::read_to_string(&log).unwrap();
            assert_eq!(
                calls,
                "stop ghost-agent.service\nstart ghost-agent.service\n"
            );
        }

        #[tokio::test]
        async fn test_systemd_failure_reports_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "echo 'unit not loaded' >&2\nexit 5");

            let controller =
                SystemdServiceController::new("ghost-agent.service", TIMEOUT, TIMEOUT)
                    .with_program(program);

            let err = controller.stop(&Shutdown::never()).await.unwrap_err();
            match err {
                ServiceError::CommandFailed { action, stderr, .. } => {
                    assert_eq!(action, ServiceAction::Stop);
                    assert_eq!(stderr, "unit not loaded");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_systemd_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "exec sleep 10");

            let controller = SystemdServiceController::new(
                "ghost-agent.service",
                Duration::from_millis(100),
                TIMEOUT,
            )
            .with_program(program);

            let err = controller.stop(&Shutdown::never()).await.unwrap_err();
            assert!(matches!(err, ServiceError::Timeout { .. }));
        }

        #[tokio::test]
        async fn test_systemd_cancellation_returns_promptly() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "exec sleep 10");

            let controller = SystemdServiceController::new("ghost-agent.service", TIMEOUT, TIMEOUT)
                .with_program(program);
            let (trigger, shutdown) = Shutdown::channel();

            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                trigger.trigger();
            });

            let started = std::time::Instant::now();
            let err = controller.stop(&shutdown).await.unwrap_err();
            canceller.await.unwrap();

            assert!(matches!(err, ServiceError::Cancelled { .. }));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_systemd_missing_program() {
            let controller =
                SystemdServiceController::new("ghost-agent.service", TIMEOUT, TIMEOUT)
                    .with_program("/nonexistent/systemctl");

            let err = controller.start(&Shutdown::never()).await.unwrap_err();
            assert!(matches!(err, ServiceError::Spawn { .. }));
        }
    }
}
