//! Error taxonomy of an update run.
//!
//! Components below the orchestrator only report what went wrong; the
//! [`Updater`](crate::updater::Updater) decides whether that means
//! aborting, resuming the service, or rolling back. The variant reached at
//! the top is what the process reports.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::health::HealthError;
use crate::install::InstallError;
use crate::lock::LockError;
use crate::service::ServiceError;
use crate::state::StateError;
use crate::updater::Phase;

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    /// Update failed before anything was installed; the service was resumed.
    pub const FAILED: u8 = 1;
    /// Update failed and the previous binary was restored.
    pub const ROLLED_BACK: u8 = 2;
    /// Rollback itself failed. Operator intervention required.
    pub const ROLLBACK_FAILED: u8 = 3;
    /// Another attempt holds the update lock; try later.
    pub const LOCK_HELD: u8 = 4;
    /// Cancelled by a signal or the overall deadline.
    pub const CANCELLED: u8 = 5;
    /// Bad flags or configuration.
    pub const USAGE: u8 = 64;
}

/// Errors surfaced by an update or rollback run.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update lock error: {0}")]
    Lock(#[from] LockError),

    #[error("update cancelled during {phase}")]
    Cancelled { phase: Phase },

    #[error("service control failed: {0}")]
    Service(#[from] ServiceError),

    #[error("backup of {path} failed: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("install failed: {0}")]
    Install(#[from] InstallError),

    #[error("health verification failed: {0}")]
    Health(#[from] HealthError),

    #[error("state persistence failed: {0}")]
    State(#[from] StateError),

    #[error("backup {path} is missing, nothing to restore")]
    BackupMissing { path: PathBuf },

    #[error("restore of {path} failed: {source}")]
    Restore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("update rolled back after: {cause}")]
    RolledBack { cause: Box<UpdateError> },

    #[error("rollback failed: {source} (rolling back after: {cause})")]
    RollbackFailed {
        cause: Box<UpdateError>,
        #[source]
        source: Box<UpdateError>,
    },
}

impl UpdateError {
    /// Stable reason code for logs and the state file.
    pub fn reason_code(&self) -> &'static str {
        match self {
            UpdateError::Lock(LockError::Held { .. }) => "lock_held",
            UpdateError::Lock(LockError::Cancelled) => "cancelled",
            UpdateError::Lock(_) => "lock_failed",
            UpdateError::Cancelled { .. } => "cancelled",
            UpdateError::Service(_) => "service_control_failed",
            UpdateError::Backup { .. } => "backup_failed",
            UpdateError::Install(_) => "install_failed",
            UpdateError::Health(HealthError::Cancelled) => "cancelled",
            UpdateError::Health(_) => "health_check_failed",
            UpdateError::State(_) => "state_write_failed",
            UpdateError::BackupMissing { .. } => "backup_missing",
            UpdateError::Restore { .. } => "restore_failed",
            UpdateError::RolledBack { .. } => "rolled_back",
            UpdateError::RollbackFailed { .. } => "rollback_failed",
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            UpdateError::Lock(LockError::Held { .. }) => exit_code::LOCK_HELD,
            UpdateError::Lock(LockError::Cancelled)
            | UpdateError::Cancelled { .. }
            | UpdateError::Health(HealthError::Cancelled) => exit_code::CANCELLED,
            UpdateError::RolledBack { .. } => exit_code::ROLLED_BACK,
            UpdateError::RollbackFailed { .. } => exit_code::ROLLBACK_FAILED,
            _ => exit_code::FAILED,
        }
    }

    /// Whether this run ended because cancellation fired.
    pub fn is_cancelled(&self) -> bool {
        self.exit_code() == exit_code::CANCELLED
    }

    /// Whether another attempt holds the update lock.
    pub fn is_lock_held(&self) -> bool {
        matches!(self, UpdateError::Lock(LockError::Held { .. }))
    }
}
