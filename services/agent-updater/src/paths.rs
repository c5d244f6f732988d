//! Fixed on-disk layout under the updater base directory.

use std::path::{Path, PathBuf};

/// Directory holding the backup copy of the pre-update binary.
pub const BACKUP_DIR: &str = "backup";

/// Directory where the fetcher places the staged update archive.
pub const STAGING_DIR: &str = "staging";

/// Advisory lock record.
pub const LOCK_FILE: &str = "update.lock";

/// Durable record of the last update attempt.
pub const STATE_FILE: &str = "update-state.json";

/// Locations derived from one base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub backup_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub lock_file: PathBuf,
    pub state_file: PathBuf,
}

impl Paths {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            backup_dir: base.join(BACKUP_DIR),
            staging_dir: base.join(STAGING_DIR),
            lock_file: base.join(LOCK_FILE),
            state_file: base.join(STATE_FILE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths::new("/var/lib/ghost/updater");

        assert_eq!(
            paths.backup_dir,
            PathBuf::from("/var/lib/ghost/updater/backup")
        );
        assert_eq!(
            paths.staging_dir,
            PathBuf::from("/var/lib/ghost/updater/staging")
        );
        assert_eq!(
            paths.lock_file,
            PathBuf::from("/var/lib/ghost/updater/update.lock")
        );
        assert_eq!(
            paths.state_file,
            PathBuf::from("/var/lib/ghost/updater/update-state.json")
        );
    }
}
