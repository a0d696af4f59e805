use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

/// Suffix appended to a destination that is moved aside under the
/// overwrite policy. Literal on-disk convention.
pub const BACKUP_SUFFIX: &str = ".bak";

/// What to do when the destination path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Leave the existing file alone and skip the job
    Skip,
    /// Move the existing file to `<path>.bak` and write fresh
    Overwrite,
    /// Write to `<base> (<n>)<ext>` with the first free counter
    Rename,
}

/// Outcome of conflict resolution for one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The destination exists and the policy says not to touch it
    Skip,
    /// Safe to write to `final_path`; `backup_path` holds the previous
    /// content under the overwrite policy
    Write {
        final_path: PathBuf,
        backup_path: Option<PathBuf>,
    },
}

/// `<path>.bak` for a given destination
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Counter-suffixed sibling of `desired`: `"{stem} ({n}){ext}"`
fn renamed_candidate(desired: &Path, n: u32) -> PathBuf {
    let stem = desired
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match desired.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    desired.with_file_name(name)
}

/// Decide how to write to `desired` under `policy`.
///
/// Runs to completion before any external operation starts; an error here
/// means the job fails with no partial write. Only the overwrite policy
/// mutates the filesystem (the backup rename).
pub fn resolve(desired: &Path, policy: ConflictPolicy) -> io::Result<Resolution> {
    if !desired.exists() {
        return Ok(Resolution::Write {
            final_path: desired.to_path_buf(),
            backup_path: None,
        });
    }

    match policy {
        ConflictPolicy::Skip => Ok(Resolution::Skip),
        ConflictPolicy::Overwrite => {
            let backup = backup_path(desired);
            if backup.exists() {
                fs::remove_file(&backup)?;
            }
            fs::rename(desired, &backup)?;
            debug!(
                "moved existing destination aside: {} -> {}",
                desired.display(),
                backup.display()
            );
            Ok(Resolution::Write {
                final_path: desired.to_path_buf(),
                backup_path: Some(backup),
            })
        }
        ConflictPolicy::Rename => {
            for n in 1u32.. {
                let candidate = renamed_candidate(desired, n);
                if !candidate.exists() {
                    return Ok(Resolution::Write {
                        final_path: candidate,
                        backup_path: None,
                    });
                }
            }
            unreachable!("rename counter exhausted")
        }
    }
}

/// Drop the backup after a successful write
pub fn discard_backup(backup: &Path) -> io::Result<()> {
    if backup.exists() {
        fs::remove_file(backup)?;
    }
    Ok(())
}

/// Undo a failed overwrite: delete a partially-written `final_path` if
/// present and put the backup back, so the net effect is indistinguishable
/// from never having attempted the write.
pub fn restore_backup(final_path: &Path, backup: &Path) -> io::Result<()> {
    if !backup.exists() {
        return Ok(());
    }
    if final_path.exists() {
        fs::remove_file(final_path)?;
    }
    fs::rename(backup, final_path)
}
