//! plfm-vt Agent Updater Library
//!
//! Replaces the host agent binary with a staged release and keeps the host
//! recoverable if anything goes wrong along the way.
//!
//! ## Architecture
//!
//! The [`Updater`] drives an update through a fixed phase sequence and owns
//! every recovery decision. Everything it touches sits behind a small seam:
//!
//! ```text
//! Updater
//! ├── LockManager        (single-writer lock file with TTL takeover)
//! ├── StateWriter        (durable update-state.json record)
//! ├── ServiceController  (systemd in production, mock in tests)
//! ├── install            (archive extraction + atomic replace)
//! └── HealthChecker      (version-aware HTTP health check)
//! ```
//!
//! Cancellation is cooperative: a [`Shutdown`] handle is passed down and
//! every wait races against it. Restarting a stopped service is never
//! cancellable.
//!
//! ## Modules
//!
//! - `updater`: Phase orchestration and rollback
//! - `lock`, `state`: Files shared with the agent and other updaters
//! - `service`: Service manager control
//! - `health`: Post-restart verification
//! - `install`, `fsutil`: Atomic file replacement

pub mod config;
pub mod error;
pub mod fsutil;
pub mod health;
pub mod install;
pub mod lock;
pub mod paths;
pub mod service;
pub mod signal;
pub mod state;
pub mod updater;

// Re-export commonly used types
pub use config::UpdaterConfig;
pub use error::UpdateError;
pub use service::{MockServiceController, ServiceController, SystemdServiceController};
pub use signal::{Shutdown, ShutdownTrigger};
pub use state::{PersistedState, StateWriter, UpdateState};
pub use updater::{Phase, UpdateReport, Updater};
