//! File operations: opens, durability, atomic finalize, enumeration

use crate::fsops::{paths, FsError, FsResult};
use globset::GlobSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{File, OpenOptions};

/// One enumerated candidate file
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Absolute path
    pub path: PathBuf,

    /// Size in bytes at enumeration time
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Whether a shared-read open succeeded during enumeration
    pub readable: bool,
}

/// Open a file for reading without denying other readers
///
/// On Unix this is the default sharing mode; the contract matters on
/// platforms with mandatory share flags, where external observers must
/// still be allowed to read during a copy.
pub async fn open_shared_read(path: &Path) -> FsResult<File> {
    Ok(OpenOptions::new().read(true).open(path).await?)
}

/// Non-blocking shared-read probe used by the stability detector
pub async fn probe_shared_read(path: &Path) -> bool {
    OpenOptions::new().read(true).open(path).await.is_ok()
}

/// Create a staging file exclusively, failing if it already exists
///
/// Parent directories are created as needed.
pub async fn create_staging_exclusive(path: &Path) -> FsResult<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?)
}

/// Flush file data and metadata to the disk
pub async fn flush_to_disk(file: &File) -> FsResult<()> {
    file.sync_all().await?;
    Ok(())
}

#[cfg(unix)]
fn volume_of(path: &Path) -> FsResult<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.dev())
}

#[cfg(not(unix))]
fn volume_of(path: &Path) -> FsResult<u64> {
    // Best effort off Unix: treat the first path component as the volume key.
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    path.components().next().hash(&mut hasher);
    Ok(hasher.finish())
}

/// Atomically move a finalized staging file to its final path
///
/// Contracts:
/// - Source and destination must share a volume; a cross-volume request
///   fails with [`FsError::CrossVolumeRename`] instead of degrading to a
///   copy-and-delete.
/// - Uniqueness is enforced by the filesystem, not by a probe: the staging
///   file is hard-linked to the final name and `link(2)` refuses to
///   replace an existing destination. Of any number of concurrent
///   finalize attempts for one final path, exactly one succeeds; every
///   other fails with [`FsError::FinalPathOccupied`] and an existing file
///   is never overwritten.
pub async fn atomic_rename(staging: &Path, final_path: &Path) -> FsResult<()> {
    let final_parent = final_path
        .parent()
        .ok_or_else(|| FsError::PathOutsideRoot(final_path.to_path_buf()))?;
    tokio::fs::create_dir_all(final_parent).await?;

    let staging_volume = volume_of(staging)?;
    let final_volume = volume_of(final_parent)?;
    if staging_volume != final_volume {
        return Err(FsError::CrossVolumeRename {
            from: staging.to_path_buf(),
            to: final_path.to_path_buf(),
        });
    }

    // link-then-unlink instead of rename: rename silently replaces an
    // existing destination, link fails it atomically
    match tokio::fs::hard_link(staging, final_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(FsError::FinalPathOccupied(final_path.to_path_buf()));
        }
        // EXDEV backstop in case the device probe was fooled (bind
        // mounts, overlay filesystems)
        Err(e) if e.raw_os_error() == Some(18) => {
            return Err(FsError::CrossVolumeRename {
                from: staging.to_path_buf(),
                to: final_path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    // A crash here leaves the extra staging link for the recovery orphan
    // sweep; the finalized file is already in place
    tokio::fs::remove_file(staging).await?;
    Ok(())
}

/// Remove a file, tolerating its absence
pub async fn remove_file_if_exists(path: &Path) -> FsResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively enumerate candidate files under a root
///
/// Filters by the include glob set (matched against the file name),
/// skips the engine's own staging artifacts, and reports size, mtime and
/// readability in one pass.
pub async fn enumerate(root: &Path, include: &GlobSet) -> FsResult<Vec<FileInfo>> {
    let mut results = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                // Never descend into the engine's own staging space
                if path.file_name().and_then(|n| n.to_str()) == Some(paths::STAGING_DIR_NAME) {
                    continue;
                }
                stack.push(path);
                continue;
            }
            if file_type.is_symlink() {
                continue;
            }
            if paths::is_staging_artifact(&path) {
                continue;
            }

            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !include.is_match(file_name) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let readable = probe_shared_read(&path).await;

            results.push(FileInfo {
                path,
                size: metadata.len(),
                modified,
                readable,
            });
        }
    }

    Ok(results)
}

/// List every staging artifact under a target's staging directory
pub async fn list_staging_files(target_base: &Path) -> FsResult<Vec<PathBuf>> {
    let staging_root = paths::staging_dir(target_base);
    let mut results = Vec::new();

    if !tokio::fs::try_exists(&staging_root).await? {
        return Ok(results);
    }

    let mut stack = vec![staging_root];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            } else if paths::is_staging_artifact(&path) {
                results.push(path);
            }
        }
    }

    Ok(results)
}
