//! Durable record of the last update attempt.
//!
//! The record is rewritten at every phase boundary through the atomic write
//! helper, so tooling polling the file after the process exits always reads
//! a complete document.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fsutil;

/// Errors from state file operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file not found: {0}")]
    NotFound(PathBuf),

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lifecycle of an update attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    #[default]
    Pending,
    InProgress,
    Completed,
    RolledBack,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub target_version: String,

    #[serde(default)]
    pub state: UpdateState,

    /// When the record was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Error message of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PersistedState {
    pub fn new(target_version: impl Into<String>, state: UpdateState) -> Self {
        Self {
            target_version: target_version.into(),
            state,
            updated_at: Some(Utc::now()),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Reads and atomically writes the state file.
#[derive(Debug, Clone)]
pub struct StateWriter {
    path: PathBuf,
}

impl StateWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the state file with `state`.
    pub fn write(&self, state: &PersistedState) -> Result<(), StateError> {
        let contents = serde_json::to_vec_pretty(state)?;
        fsutil::atomic_write(&self.path, &contents, None).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            path = %self.path.display(),
            target_version = %state.target_version,
            state = %state.state,
            "Update state persisted"
        );
        Ok(())
    }

    /// Write a fresh record for `target_version`.
    pub fn record(
        &self,
        target_version: &str,
        state: UpdateState,
        detail: Option<String>,
    ) -> Result<(), StateError> {
        let mut record = PersistedState::new(target_version, state);
        record.detail = detail;
        self.write(&record)
    }

    /// Read the current state file.
    pub fn read(&self) -> Result<PersistedState, StateError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&contents).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }
}
