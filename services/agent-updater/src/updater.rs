//! Update orchestrator.
//!
//! Drives one update through a fixed sequence of phases:
//!
//! ```text
//! AcquireLock -> Stopping -> Backup -> Installing -> Starting -> Verifying -> Completed
//!                                          |             |            |
//!                                          +-------------+------------+--> rollback
//! ```
//!
//! Only the orchestrator decides what a failure means. The rules:
//!
//! - Nothing is touched before the lock is held and the service stopped, so
//!   failures or cancellation up to that point simply abort.
//! - Once the service has been stopped, every exit path starts it again
//!   before returning. Restarting is never cancellable.
//! - Install, start and health failures restore the backup (rollback).
//! - Cancellation while verifying returns without rolling back: the new
//!   binary is running and has not been judged unhealthy.
//! - The lock guard is taken once and released once, at the end of `run`.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::fsutil;
use crate::health::{HealthChecker, HealthError};
use crate::install::{self, InstallReport};
use crate::lock::{LockError, LockGuard, LockManager};
use crate::service::{ServiceController, ServiceError};
use crate::signal::Shutdown;
use crate::state::{StateWriter, UpdateState};

/// Orchestrator progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    AcquireLock,
    Stopping,
    Backup,
    Installing,
    Starting,
    Verifying,
    Completed,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 7] = [
        Phase::AcquireLock,
        Phase::Stopping,
        Phase::Backup,
        Phase::Installing,
        Phase::Starting,
        Phase::Verifying,
        Phase::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquireLock => "acquire_lock",
            Self::Stopping => "stopping",
            Self::Backup => "backup",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on every phase transition.
pub type PhaseObserver = Box<dyn Fn(Phase) + Send + Sync>;

/// Summary of a completed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub target_version: String,
    /// Size of the installed binary.
    pub installed_bytes: u64,
    /// Size of the backup copy.
    pub backup_bytes: u64,
    /// Temp artifacts of earlier interrupted installs or backups that were removed.
    pub stale_removed: usize,
}

/// What the orchestrator knows about the service when rolling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceStatus {
    /// Stopped by us and not started since.
    Stopped,
    /// Possibly running.
    Unknown,
}

/// Self-update orchestrator.
pub struct Updater<S: ServiceController + ?Sized> {
    config: UpdaterConfig,
    service: Arc<S>,
    health: HealthChecker,
    locks: LockManager,
    state: StateWriter,
    observer: Option<PhaseObserver>,
}

impl<S: ServiceController + ?Sized> Updater<S> {
    /// Create an updater driving `service`.
    pub fn new(config: UpdaterConfig, service: Arc<S>) -> Result<Self, UpdateError> {
        let health =
            HealthChecker::new(config.health_request_timeout)?.with_sleep(config.sleep.clone());
        let locks = LockManager::from_config(&config);
        let state = StateWriter::new(&config.state_file);

        Ok(Self {
            config,
            service,
            health,
            locks,
            state,
            observer: None,
        })
    }

    /// Register a phase observer.
    pub fn on_phase(mut self, observer: impl Fn(Phase) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Run one update to completion.
    ///
    /// Returns `Ok` only once the new binary is installed, running, and
    /// reporting the target version.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<UpdateReport, UpdateError> {
        self.enter(Phase::AcquireLock);
        let lock = self.lock(shutdown).await?;

        let result = self.run_locked(shutdown).await;
        self.release(lock);

        match &result {
            Ok(report) => info!(
                target_version = %report.target_version,
                installed_bytes = report.installed_bytes,
                "Update completed"
            ),
            Err(e @ UpdateError::RollbackFailed { .. }) => error!(
                reason = e.reason_code(),
                error = %e,
                "Update failed and rollback failed, operator intervention required"
            ),
            Err(e) => warn!(
                reason = e.reason_code(),
                error = %e,
                "Update did not complete"
            ),
        }

        result
    }

    /// Restore the backup binary and restart the service.
    ///
    /// `shutdown` is honoured only until the lock is held; once the restore
    /// has begun it runs to completion.
    pub async fn rollback(&self, shutdown: &Shutdown) -> Result<(), UpdateError> {
        let lock = self.lock(shutdown).await?;

        let result = self.rollback_locked(ServiceStatus::Unknown).await;
        if let Err(e) = &result {
            error!(
                reason = e.reason_code(),
                error = %e,
                "Rollback failed, operator intervention required"
            );
            self.record_failure(e);
        }

        self.release(lock);
        result
    }

    async fn run_locked(&self, shutdown: &Shutdown) -> Result<UpdateReport, UpdateError> {
        let target = self.config.target_version.as_str();
        if shutdown.is_triggered() {
            info!("Cancelled while acquiring the update lock");
            return Err(cancelled(Phase::AcquireLock));
        }
        self.state.record(target, UpdateState::Pending, None)?;

        // Stopping
        self.enter(Phase::Stopping);
        if shutdown.is_triggered() {
            // Nothing stopped, so there is nothing to resume.
            let err = cancelled(Phase::Stopping);
            self.record_failure(&err);
            return Err(err);
        }
        self.state.record(target, UpdateState::InProgress, None)?;
        if let Err(e) = self.service.stop(shutdown).await {
            // A stop interrupted or failed midway may still have taken the
            // service down.
            let err = match e {
                ServiceError::Cancelled { .. } => UpdateError::Cancelled {
                    phase: Phase::Stopping,
                },
                other => other.into(),
            };
            return Err(self.resume(err).await);
        }
        if shutdown.is_triggered() {
            return Err(self.resume(cancelled(Phase::Stopping)).await);
        }

        // Backup
        self.enter(Phase::Backup);
        let (backup_bytes, backup_stale) = match self.backup() {
            Ok(backed_up) => backed_up,
            Err(e) => return Err(self.resume(e).await),
        };
        if shutdown.is_triggered() {
            return Err(self.resume(cancelled(Phase::Backup)).await);
        }

        // Installing
        self.enter(Phase::Installing);
        let installed = match self.install() {
            Ok(report) => report,
            Err(e) => return Err(self.rollback_after(e, ServiceStatus::Stopped).await),
        };
        if shutdown.is_triggered() {
            return Err(self.resume(cancelled(Phase::Installing)).await);
        }

        // Starting
        self.enter(Phase::Starting);
        if let Err(e) = self.service.start(&Shutdown::never()).await {
            return Err(self
                .rollback_after(e.into(), ServiceStatus::Unknown)
                .await);
        }

        // Verifying
        self.enter(Phase::Verifying);
        let waited = tokio::select! {
            _ = (self.config.sleep)(self.config.initial_health_wait) => true,
            _ = shutdown.triggered() => false,
        };
        if !waited {
            return Err(self.cancelled_while_verifying());
        }
        match self
            .health
            .verify(
                &self.config.health_url,
                target,
                self.config.health_retries,
                self.config.health_interval,
                shutdown,
            )
            .await
        {
            Ok(()) => {}
            Err(HealthError::Cancelled) => return Err(self.cancelled_while_verifying()),
            Err(e) => {
                return Err(self
                    .rollback_after(e.into(), ServiceStatus::Unknown)
                    .await)
            }
        }

        // Completed
        self.enter(Phase::Completed);
        if let Err(e) = self.state.record(target, UpdateState::Completed, None) {
            warn!(error = %e, "Update completed but the state file could not be written");
        }

        Ok(UpdateReport {
            target_version: target.to_string(),
            installed_bytes: installed.bytes,
            backup_bytes,
            stale_removed: installed.stale_removed + backup_stale,
        })
    }

    /// Copy the installed binary to the backup path. Returns the bytes
    /// copied and the number of stale temp files swept from the backup dir.
    fn backup(&self) -> Result<(u64, usize), UpdateError> {
        let backup = self.config.backup_path();

        let stale = fsutil::remove_stale_temp_files(&backup).map_err(|source| {
            UpdateError::Backup {
                path: backup.clone(),
                source,
            }
        })?;
        if !stale.is_empty() {
            info!(
                count = stale.len(),
                backup = %backup.display(),
                "Removed stale temp artifacts from an interrupted backup"
            );
        }

        let bytes = fsutil::atomic_copy(&self.config.binary_path, &backup).map_err(|source| {
            UpdateError::Backup {
                path: self.config.binary_path.clone(),
                source,
            }
        })?;

        info!(
            binary = %self.config.binary_path.display(),
            backup = %backup.display(),
            bytes,
            "Backed up current binary"
        );
        Ok((bytes, stale.len()))
    }

    fn install(&self) -> Result<InstallReport, UpdateError> {
        let report = install::install_from_archive(
            &self.config.archive_path(),
            &self.config.archive_entry,
            &self.config.binary_path,
        )?;
        Ok(report)
    }

    /// Bring the service back after an abort that installed nothing that
    /// needs undoing, and record the failure.
    async fn resume(&self, err: UpdateError) -> UpdateError {
        info!(reason = err.reason_code(), "Restarting service after aborted update");

        match self.service.start(&Shutdown::never()).await {
            Ok(()) => {
                self.record_failure(&err);
                err
            }
            Err(start_err) => {
                error!(
                    error = %start_err,
                    aborted_because = %err,
                    "Failed to restart service after aborted update"
                );
                let err = UpdateError::Service(start_err);
                self.record_failure(&err);
                err
            }
        }
    }

    /// Roll back after `cause` and fold the outcome into one error.
    async fn rollback_after(&self, cause: UpdateError, status: ServiceStatus) -> UpdateError {
        warn!(
            reason = cause.reason_code(),
            error = %cause,
            "Rolling back update"
        );

        match self.rollback_locked(status).await {
            Ok(()) => UpdateError::RolledBack {
                cause: Box::new(cause),
            },
            Err(source) => {
                let err = UpdateError::RollbackFailed {
                    cause: Box::new(cause),
                    source: Box::new(source),
                };
                self.record_failure(&err);
                err
            }
        }
    }

    async fn rollback_locked(&self, status: ServiceStatus) -> Result<(), UpdateError> {
        let binary = &self.config.binary_path;
        let backup = self.config.backup_path();

        if status != ServiceStatus::Stopped {
            if let Err(e) = self.service.stop(&Shutdown::never()).await {
                warn!(error = %e, "Stop before restore failed, restoring anyway");
            }
        }

        let restored = if backup.is_file() {
            fsutil::atomic_copy(&backup, binary)
                .map(|_| ())
                .map_err(|source| UpdateError::Restore {
                    path: binary.clone(),
                    source,
                })
        } else {
            Err(UpdateError::BackupMissing { path: backup.clone() })
        };

        // The service comes back regardless of which binary is in place.
        let started = self.service.start(&Shutdown::never()).await;

        restored?;
        started?;

        info!(
            binary = %binary.display(),
            backup = %backup.display(),
            "Previous binary restored"
        );
        if let Err(e) = self.state.record(
            &self.config.target_version,
            UpdateState::RolledBack,
            None,
        ) {
            warn!(error = %e, "Rollback completed but the state file could not be written");
        }
        Ok(())
    }

    fn cancelled_while_verifying(&self) -> UpdateError {
        info!(
            target_version = %self.config.target_version,
            "Cancelled while verifying, leaving new binary running"
        );
        cancelled(Phase::Verifying)
    }

    async fn lock(&self, shutdown: &Shutdown) -> Result<LockGuard, UpdateError> {
        if shutdown.is_triggered() {
            info!("Cancelled before acquiring the update lock");
            return Err(cancelled(Phase::AcquireLock));
        }

        self.locks.acquire(shutdown).await.map_err(|e| match e {
            LockError::Cancelled => cancelled(Phase::AcquireLock),
            other => other.into(),
        })
    }

    fn release(&self, lock: LockGuard) {
        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release update lock");
        }
    }

    fn record_failure(&self, err: &UpdateError) {
        if let Err(e) = self.state.record(
            &self.config.target_version,
            UpdateState::Failed,
            Some(err.to_string()),
        ) {
            warn!(error = %e, "Failed to persist update failure");
        }
    }

    fn enter(&self, phase: Phase) {
        info!(
            phase = %phase,
            target_version = %self.config.target_version,
            "Entering update phase"
        );
        if let Some(observer) = &self.observer {
            observer(phase);
        }
    }
}

fn cancelled(phase: Phase) -> UpdateError {
    UpdateError::Cancelled { phase }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert_eq!(Phase::ALL.first(), Some(&Phase::AcquireLock));
        assert_eq!(Phase::ALL.last(), Some(&Phase::Completed));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::AcquireLock.to_string(), "acquire_lock");
        assert_eq!(Phase::Verifying.to_string(), "verifying");
    }
}
