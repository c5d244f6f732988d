//! Configuration for a single update run.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::paths::Paths;

/// Default file name of the staged archive inside the staging directory.
pub const DEFAULT_ARCHIVE_NAME: &str = "update.tar.gz";

/// Injectable sleep used for every wait the updater performs.
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sleep backed by the tokio timer.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|duration| tokio::time::sleep(duration).boxed())
}

/// Sleep that returns immediately. Keeps retry loops deterministic in tests.
pub fn instant_sleep() -> SleepFn {
    Arc::new(|_: Duration| async {}.boxed())
}

/// Updater configuration.
#[derive(Clone)]
pub struct UpdaterConfig {
    /// Path of the installed agent binary.
    pub binary_path: PathBuf,

    /// Directory receiving the backup copy of the current binary.
    pub backup_dir: PathBuf,

    /// Directory holding the staged update archive.
    pub staging_dir: PathBuf,

    /// Advisory lock record.
    pub lock_file: PathBuf,

    /// Persisted state record.
    pub state_file: PathBuf,

    /// Health endpoint reporting liveness and running version.
    pub health_url: String,

    /// Version the update must end up running.
    pub target_version: String,

    /// File name of the archive inside `staging_dir`.
    pub archive_name: String,

    /// Entry inside the archive holding the new binary.
    pub archive_entry: String,

    pub stop_timeout: Duration,
    pub start_timeout: Duration,

    /// Number of health checks before giving up.
    pub health_retries: u32,

    /// Delay between health checks.
    pub health_interval: Duration,

    /// Per-request timeout for a health check.
    pub health_request_timeout: Duration,

    /// Wait after starting the service before the first check.
    pub initial_health_wait: Duration,

    pub lock_retries: u32,
    pub lock_retry_interval: Duration,

    /// How long a lock stays valid before it counts as abandoned.
    pub lock_ttl: Duration,

    pub sleep: SleepFn,
}

impl UpdaterConfig {
    /// Build a configuration with the standard layout under `base_dir`.
    pub fn new(
        binary_path: impl Into<PathBuf>,
        base_dir: impl AsRef<Path>,
        health_url: impl Into<String>,
        target_version: impl Into<String>,
    ) -> Self {
        let binary_path = binary_path.into();
        let paths = Paths::new(base_dir);
        let archive_entry = binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".to_string());

        Self {
            binary_path,
            backup_dir: paths.backup_dir,
            staging_dir: paths.staging_dir,
            lock_file: paths.lock_file,
            state_file: paths.state_file,
            health_url: health_url.into(),
            target_version: target_version.into(),
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
            archive_entry,
            stop_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
            health_retries: 10,
            health_interval: Duration::from_secs(3),
            health_request_timeout: Duration::from_secs(5),
            initial_health_wait: Duration::from_secs(5),
            lock_retries: 3,
            lock_retry_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(600),
            sleep: tokio_sleep(),
        }
    }

    /// Path of the staged archive.
    pub fn archive_path(&self) -> PathBuf {
        self.staging_dir.join(&self.archive_name)
    }

    /// Path of the backup copy of the binary.
    pub fn backup_path(&self) -> PathBuf {
        let name = self
            .binary_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("agent"));
        self.backup_dir.join(name)
    }

    pub fn with_archive_entry(mut self, entry: impl Into<String>) -> Self {
        self.archive_entry = entry.into();
        self
    }

    pub fn with_service_timeouts(mut self, stop: Duration, start: Duration) -> Self {
        self.stop_timeout = stop;
        self.start_timeout = start;
        self
    }

    pub fn with_health_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.health_retries = retries;
        self.health_interval = interval;
        self
    }

    pub fn with_initial_health_wait(mut self, wait: Duration) -> Self {
        self.initial_health_wait = wait;
        self
    }

    pub fn with_health_request_timeout(mut self, timeout: Duration) -> Self {
        self.health_request_timeout = timeout;
        self
    }

    pub fn with_lock_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.lock_retries = retries;
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }
}

impl fmt::Debug for UpdaterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdaterConfig")
            .field("binary_path", &self.binary_path)
            .field("backup_dir", &self.backup_dir)
            .field("staging_dir", &self.staging_dir)
            .field("lock_file", &self.lock_file)
            .field("state_file", &self.state_file)
            .field("health_url", &self.health_url)
            .field("target_version", &self.target_version)
            .field("archive_name", &self.archive_name)
            .field("archive_entry", &self.archive_entry)
            .field("stop_timeout", &self.stop_timeout)
            .field("start_timeout", &self.start_timeout)
            .field("health_retries", &self.health_retries)
            .field("health_interval", &self.health_interval)
            .field("health_request_timeout", &self.health_request_timeout)
            .field("initial_health_wait", &self.initial_health_wait)
            .field("lock_retries", &self.lock_retries)
            .field("lock_retry_interval", &self.lock_retry_interval)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_derives_layout() {
        let config = UpdaterConfig::new(
            "/opt/ghost/bin/node-agent",
            "/var/lib/ghost/updater",
            "http://127.0.0.1:8080/healthz",
            "v2.0.0",
        );

        assert_eq!(
            config.archive_path(),
            PathBuf::from("/var/lib/ghost/updater/staging/update.tar.gz")
        );
        assert_eq!(
            config.backup_path(),
            PathBuf::from("/var/lib/ghost/updater/backup/node-agent")
        );
        assert_eq!(config.archive_entry, "node-agent");
        assert_eq!(config.target_version, "v2.0.0");
    }

    #[test]
    fn test_config_overrides() {
        let config = UpdaterConfig::new("/bin/agent", "/tmp/u", "http://h", "v1")
            .with_health_retries(2, Duration::from_millis(10))
            .with_lock_retries(1, Duration::ZERO)
            .with_archive_entry("bin/agent");

        assert_eq!(config.health_retries, 2);
        assert_eq!(config.health_interval, Duration::from_millis(10));
        assert_eq!(config.lock_retries, 1);
        assert_eq!(config.archive_entry, "bin/agent");
        // Backup keeps the installed binary's name regardless of entry name
        assert_eq!(config.backup_path(), PathBuf::from("/tmp/u/backup/agent"));
    }

    #[tokio::test]
    async fn test_instant_sleep_returns() {
        let sleep = instant_sleep();
        tokio::time::timeout(Duration::from_millis(100), sleep(Duration::from_secs(3600)))
            .await
            .expect("instant sleep should not wait");
    }
}
