use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum DirEntryCategory {
    DoesNotExist,
    RegularFile,
    SymbolicLink,
    Directory,
    Unknown,
}

pub fn classify_file(path: &Path) -> DirEntryCategory {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_symlink() {
                DirEntryCategory::SymbolicLink
            } else if metadata.is_file() {
                DirEntryCategory::RegularFile
            } else if metadata.is_dir() {
                DirEntryCategory::Directory
            } else {
                DirEntryCategory::Unknown
            }
        },
        Err(_) => DirEntryCategory::DoesNotExist,
    }
}

/// Deletes `path` if it exists. Never fails: a missing file is a no-op and
/// any other error is logged and swallowed.
pub fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(err) if err.kind() == ErrorKind::NotFound => (),
        Err(err) => warn!(path = %path.display(), error = %err, "unable to remove file"),
    }
}

/// Removes every file directly inside `dir`. Subdirectories are left alone
/// so per-worker directories below a shared root survive.
pub fn clear_directory(dir: &Path) {
    clear_directory_retaining(dir, |_| false);
}

/// Like `clear_directory`, but files for which `retain` returns true stay.
pub fn clear_directory_retaining(dir: &Path, retain: impl Fn(&Path) -> bool) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "unable to list directory");
            return;
        },
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        match classify_file(&path) {
            DirEntryCategory::Directory => continue,
            _ if retain(&path) => debug!(path = %path.display(), "retained"),
            _ => remove_file(&path),
        }
    }
}
