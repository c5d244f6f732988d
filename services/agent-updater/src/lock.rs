//! File-based update lock with expiry.
//!
//! Only one update attempt may touch an installation at a time. The lock is a
//! JSON record created exclusively on disk; a record whose `expires_at` has
//! passed belongs to a crashed holder and may be taken over.
//!
//! Creation writes the full record to a temp file and hard-links it onto the
//! lock path. `link(2)` fails if the target exists, so contenders never see a
//! half-written record.
//!
//! Removing a record (takeover or release) happens only while holding an
//! exclusive `flock` on the sidecar `<lock>.guard` file. A record inspected
//! under that flock cannot be replaced before it is removed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{tokio_sleep, SleepFn, UpdaterConfig};
use crate::fsutil;
use crate::signal::Shutdown;

/// How many times a single `try_lock` removes an abandoned record and retries.
const MAX_TAKEOVER_ATTEMPTS: usize = 3;

/// Suffix of the sidecar file serializing record removal.
const GUARD_SUFFIX: &str = ".guard";

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("update lock held by pid {pid} (holder {holder}) until {expires_at}")]
    Held {
        holder: Uuid,
        pid: u32,
        expires_at: DateTime<Utc>,
    },

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Random id of the acquiring attempt.
    pub holder: Uuid,
    /// Process that acquired the lock.
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            holder: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at,
            expires_at,
        }
    }

    /// Whether the record has passed its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What currently sits at the lock path.
enum Existing {
    Missing,
    Record(LockRecord),
    Corrupt(String),
}

/// Creates and inspects the update lock.
pub struct LockManager {
    path: PathBuf,
    ttl: Duration,
    retries: u32,
    retry_interval: Duration,
    sleep: SleepFn,
}

impl LockManager {
    /// Create a lock manager making a single acquisition attempt.
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            retries: 1,
            retry_interval: Duration::ZERO,
            sleep: tokio_sleep(),
        }
    }

    /// Lock manager using the updater's lock settings.
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(&config.lock_file, config.lock_ttl)
            .with_retries(config.lock_retries, config.lock_retry_interval)
            .with_sleep(config.sleep.clone())
    }

    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make one attempt to take the lock, valid for `ttl`.
    ///
    /// An unexpired record fails with [`LockError::Held`]. An expired or
    /// unreadable record is removed and the attempt repeated.
    pub fn try_lock(&self, ttl: Duration) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let record = LockRecord::new(ttl);

        for _ in 0..MAX_TAKEOVER_ATTEMPTS {
            match self.create_exclusive(&record) {
                Ok(()) => {
                    debug!(
                        path = %self.path.display(),
                        holder = %record.holder,
                        expires_at = %record.expires_at,
                        "Update lock acquired"
                    );
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        holder: record.holder,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(self.io_error(source)),
            }

            let _removal = removal_guard(&self.path)?;
            match self.inspect()? {
                Existing::Missing => continue,
                Existing::Record(existing) if !existing.is_expired(Utc::now()) => {
                    return Err(held(&existing));
                }
                Existing::Record(existing) => {
                    warn!(
                        path = %self.path.display(),
                        stale_holder = %existing.holder,
                        stale_pid = existing.pid,
                        expired_at = %existing.expires_at,
                        "Taking over abandoned update lock"
                    );
                }
                Existing::Corrupt(detail) => {
                    warn!(
                        path = %self.path.display(),
                        detail = %detail,
                        "Unreadable update lock record, treating as abandoned"
                    );
                }
            }

            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(self.io_error(source)),
            }
        }

        // Lost every race against other contenders.
        match self.inspect()? {
            Existing::Record(existing) => Err(held(&existing)),
            _ => Err(self.io_error(io::Error::new(
                io::ErrorKind::WouldBlock,
                "update lock contended",
            ))),
        }
    }

    /// Take the lock, retrying while it is held by someone else.
    ///
    /// Observes `shutdown` between attempts. Exhausting the retries returns
    /// the last [`LockError::Held`].
    pub async fn acquire(&self, shutdown: &Shutdown) -> Result<LockGuard, LockError> {
        let attempts = self.retries.max(1);
        let mut attempt = 1;

        loop {
            if shutdown.is_triggered() {
                return Err(LockError::Cancelled);
            }

            match self.try_lock(self.ttl) {
                Ok(guard) => return Ok(guard),
                Err(err @ LockError::Held { .. }) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        error = %err,
                        "Update lock busy, retrying"
                    );
                    tokio::select! {
                        _ = (self.sleep)(self.retry_interval) => {}
                        _ = shutdown.triggered() => return Err(LockError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Current lock record, if a readable one exists.
    pub fn holder(&self) -> Result<Option<LockRecord>, LockError> {
        match self.inspect()? {
            Existing::Record(record) => Ok(Some(record)),
            Existing::Missing | Existing::Corrupt(_) => Ok(None),
        }
    }

    fn create_exclusive(&self, record: &LockRecord) -> io::Result<()> {
        let tmp = fsutil::temp_path_for(&self.path)?;
        let contents = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        fs::write(&tmp, contents)?;

        let linked = fs::hard_link(&tmp, &self.path);
        if let Err(e) = fs::remove_file(&tmp) {
            debug!(path = %tmp.display(), error = %e, "Failed to remove lock temp file");
        }
        linked
    }

    fn inspect(&self) -> Result<Existing, LockError> {
        read_existing(&self.path)
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Proof of lock ownership. Releasing consumes the guard; dropping an
/// unreleased guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    holder: Uuid,
    released: bool,
}

impl LockGuard {
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Remove the lock record.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_owned(&self.path, self.holder)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = remove_owned(&self.path, self.holder) {
            warn!(error = %e, "Failed to release update lock on drop");
        }
    }
}

fn read_existing(path: &Path) -> Result<Existing, LockError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Existing::Missing),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_slice::<LockRecord>(&contents) {
        Ok(record) => Ok(Existing::Record(record)),
        Err(e) => Ok(Existing::Corrupt(e.to_string())),
    }
}

/// Remove the record at `path` only if it still belongs to `holder`.
fn remove_owned(path: &Path, holder: Uuid) -> Result<(), LockError> {
    let _removal = removal_guard(path)?;
    match read_existing(path)? {
        Existing::Missing => {
            warn!(path = %path.display(), "Update lock already gone at release");
            return Ok(());
        }
        Existing::Record(record) if record.holder != holder => {
            warn!(
                path = %path.display(),
                current_holder = %record.holder,
                "Update lock was taken over, leaving it in place"
            );
            return Ok(());
        }
        Existing::Corrupt(detail) => {
            warn!(
                path = %path.display(),
                detail = %detail,
                "Update lock record unreadable at release, leaving it in place"
            );
            return Ok(());
        }
        Existing::Record(_) => {}
    }

    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), holder = %holder, "Update lock released");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Take the exclusive flock on the sidecar of `lock_path`. Dropping the
/// returned file releases it.
fn removal_guard(lock_path: &Path) -> Result<File, LockError> {
    let mut name = lock_path.as_os_str().to_owned();
    name.push(GUARD_SUFFIX);
    let guard_path = PathBuf::from(name);

    let io_error = |source| LockError::Io {
        path: guard_path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&guard_path)
        .map_err(io_error)?;
    file.lock_exclusive().map_err(io_error)?;
    Ok(file)
}

fn held(record: &LockRecord) -> LockError {
    LockError::Held {
        holder: record.holder,
        pid: record.pid,
        expires_at: record.expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::instant_sleep;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn test_lock_and_release() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let guard = manager.try_lock(TTL).unwrap();
        assert!(manager.path().exists());

        let holder = manager.holder().unwrap().unwrap();
        assert_eq!(holder.holder, guard.holder());
        assert_eq!(holder.pid, std::process::id());

        guard.release().unwrap();
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_second_lock_is_held() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let _guard = manager.try_lock(TTL).unwrap();
        let err = manager.try_lock(TTL).unwrap_err();

        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let stale = manager.try_lock(Duration::ZERO).unwrap();
        let stale_holder = stale.holder();
        // Simulate a crashed holder: the guard never runs its cleanup.
        std::mem::forget(stale);

        let guard = manager.try_lock(TTL).unwrap();
        assert_ne!(guard.holder(), stale_holder);
        assert_eq!(manager.holder().unwrap().unwrap().holder, guard.holder());
    }

    #[test]
    fn test_corrupt_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.lock");
        fs::write(&path, b"not json").unwrap();

        let manager = LockManager::new(&path, TTL);
        let guard = manager.try_lock(TTL).unwrap();

        assert_eq!(manager.holder().unwrap().unwrap().holder, guard.holder());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        {
            let _guard = manager.try_lock(TTL).unwrap();
            assert!(manager.path().exists());
        }

        assert!(!manager.path().exists());
    }

    #[test]
    fn test_release_leaves_new_holder_in_place() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let old = manager.try_lock(Duration::ZERO).unwrap();
        let new = manager.try_lock(TTL).unwrap();

        old.release().unwrap();
        assert_eq!(manager.holder().unwrap().unwrap().holder, new.holder());

        new.release().unwrap();
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let _guard = manager.try_lock(TTL).unwrap();
        let _ = manager.try_lock(TTL);

        let temps: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(fsutil::TEMP_MARKER))
            .collect();
        assert!(temps.is_empty(), "leftover temp files: {temps:?}");
    }

    #[test]
    fn test_concurrent_takeover_has_single_winner() {
        use std::sync::Barrier;

        const CONTENDERS: usize = 4;

        let dir = tempdir().unwrap();
        let path = dir.path().join("update.lock");

        for round in 0..200 {
            // A crashed holder leaves an expired record behind.
            std::mem::forget(LockManager::new(&path, TTL).try_lock(Duration::ZERO).unwrap());

            let barrier = Barrier::new(CONTENDERS);
            let guards: Vec<LockGuard> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..CONTENDERS)
                    .map(|_| {
                        scope.spawn(|| {
                            let manager = LockManager::new(&path, TTL);
                            barrier.wait();
                            manager.try_lock(TTL).ok()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().unwrap())
                    .collect()
            });

            assert_eq!(guards.len(), 1, "round {round}: {} holders", guards.len());
            let current = LockManager::new(&path, TTL).holder().unwrap().unwrap();
            assert_eq!(current.holder, guards[0].holder());

            for guard in guards {
                guard.release().unwrap();
            }
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_acquire_retries_then_reports_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.lock");
        let _other = LockManager::new(&path, TTL).try_lock(TTL).unwrap();

        let manager = LockManager::new(&path, TTL)
            .with_retries(3, Duration::from_secs(1))
            .with_sleep(instant_sleep());

        let err = manager.acquire(&Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path().join("update.lock"), TTL);

        let (trigger, shutdown) = Shutdown::channel();
        trigger.trigger();

        let err = manager.acquire(&shutdown).await.unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
        assert!(!manager.path().exists());
    }
}
