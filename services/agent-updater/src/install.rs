//! Installs the new binary from the staged archive.
//!
//! The fetcher leaves a (usually gzipped) tarball in the staging directory.
//! Only the entry holding the agent binary is extracted, streamed straight
//! into a temp file beside the installed binary and renamed into place.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil;

/// Errors from installing the staged binary.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("staged archive not found: {0}")]
    ArchiveMissing(PathBuf),

    #[error("entry {entry} not found in {archive}")]
    EntryMissing { archive: PathBuf, entry: String },

    #[error("archive entry {0} is not a regular file")]
    NotAFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Bytes written to the installed binary.
    pub bytes: u64,
    /// Stale temp artifacts removed before installing.
    pub stale_removed: usize,
}

/// Extract `entry_name` from `archive` over `dest`.
///
/// The installed binary keeps the permissions of the file it replaces, or
/// gets `0o755` when there was none.
pub fn install_from_archive(
    archive: &Path,
    entry_name: &str,
    dest: &Path,
) -> Result<InstallReport, InstallError> {
    let stale = fsutil::remove_stale_temp_files(dest)?;
    if !stale.is_empty() {
        info!(
            count = stale.len(),
            binary = %dest.display(),
            "Removed stale temp artifacts from an interrupted install"
        );
    }

    let mode = fsutil::file_mode(dest)?.unwrap_or(fsutil::DEFAULT_BINARY_MODE);

    let file = match File::open(archive) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InstallError::ArchiveMissing(archive.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);

    let bytes = if is_gzip(archive)? {
        extract_entry(&mut Archive::new(GzDecoder::new(reader)), entry_name, dest, mode)?
    } else {
        extract_entry(&mut Archive::new(reader), entry_name, dest, mode)?
    };

    match bytes {
        Some(bytes) => {
            info!(
                archive = %archive.display(),
                binary = %dest.display(),
                bytes,
                "Installed binary from staged archive"
            );
            Ok(InstallReport {
                bytes,
                stale_removed: stale.len(),
            })
        }
        None => Err(InstallError::EntryMissing {
            archive: archive.to_path_buf(),
            entry: entry_name.to_string(),
        }),
    }
}

fn extract_entry<R: Read>(
    archive: &mut Archive<R>,
    entry_name: &str,
    dest: &Path,
    mode: u32,
) -> Result<Option<u64>, InstallError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Check for path traversal
        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping archive path with parent directory");
            continue;
        }

        if !entry_matches(&path, entry_name) {
            debug!(path = %path.display(), "Skipping archive entry");
            continue;
        }

        if !entry.header().entry_type().is_file() {
            return Err(InstallError::NotAFile(path.display().to_string()));
        }

        let bytes = fsutil::atomic_write_from(dest, &mut entry, Some(mode))?;
        return Ok(Some(bytes));
    }

    Ok(None)
}

/// Compare archive paths ignoring `./` segments.
fn entry_matches(path: &Path, wanted: &str) -> bool {
    let strip = |p: &Path| -> PathBuf {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    };
    strip(path) == strip(Path::new(wanted))
}

/// Check for the gzip magic bytes.
fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
