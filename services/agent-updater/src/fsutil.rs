//! Crash-safe file replacement.
//!
//! Every durable write the updater makes (binary install, binary restore,
//! backup, state persistence) goes through [`atomic_write_from`]: content is
//! written to `<name>.tmp.<pid>.<nonce>` in the destination directory, synced,
//! then renamed over the destination. Readers observe either the old file or
//! the complete new one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// Infix that marks a temp artifact belonging to a destination file.
pub const TEMP_MARKER: &str = ".tmp.";

/// Mode applied to installed binaries when no previous mode is known.
pub const DEFAULT_BINARY_MODE: u32 = 0o755;

/// Build a unique temp path beside `dest`.
pub fn temp_path_for(dest: &Path) -> io::Result<PathBuf> {
    let name = file_name(dest)?;
    let suffix = format!("{}.{}", std::process::id(), Uuid::new_v4().simple());
    Ok(dest.with_file_name(format!("{name}{TEMP_MARKER}{suffix}")))
}

/// Stream `reader` into `dest` atomically, optionally setting permissions.
///
/// Returns the number of bytes written. On failure the temp file is removed
/// and `dest` is left untouched.
pub fn atomic_write_from<R: Read + ?Sized>(
    dest: &Path,
    reader: &mut R,
    mode: Option<u32>,
) -> io::Result<u64> {
    let parent = parent_dir(dest);
    fs::create_dir_all(parent)?;

    let tmp = temp_path_for(dest)?;
    let result = write_then_rename(&tmp, dest, reader, mode);
    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
    result
}

/// Write `bytes` into `dest` atomically.
pub fn atomic_write(dest: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<u64> {
    let mut reader = bytes;
    atomic_write_from(dest, &mut reader, mode)
}

/// Copy `src` over `dest` atomically, carrying over the source permissions.
pub fn atomic_copy(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut source = File::open(src)?;
    let mode = file_mode(src)?;
    atomic_write_from(dest, &mut source, mode)
}

/// Permission bits of `path`, or `None` when it does not exist.
pub fn file_mode(path: &Path) -> io::Result<Option<u32>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(mode_of(&metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove `<name>.tmp.*` leftovers of `dest` from interrupted writes.
///
/// Returns the paths that were removed.
pub fn remove_stale_temp_files(dest: &Path) -> io::Result<Vec<PathBuf>> {
    let prefix = format!("{}{TEMP_MARKER}", file_name(dest)?);
    let dir = parent_dir(dest);

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(&prefix))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale temp file");
                removed.push(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(removed)
}

fn write_then_rename<R: Read + ?Sized>(
    tmp: &Path,
    dest: &Path,
    reader: &mut R,
    mode: Option<u32>,
) -> io::Result<u64> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(tmp)?;
    let written = io::copy(reader, &mut file)?;

    if let Some(mode) = mode {
        set_mode(tmp, mode)?;
    }

    file.sync_all()?;
    drop(file);

    fs::rename(tmp, dest)?;
    sync_dir(parent_dir(dest));

    Ok(written)
}

fn file_name(path: &Path) -> io::Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no usable file name: {}", path.display()),
            )
        })
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Persist the rename itself. Not every filesystem supports syncing a
/// directory handle, so failures are only logged.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(dir = %dir.display(), error = %e, "Directory sync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
