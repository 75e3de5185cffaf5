//! Path canonicalization, confinement and staging layout

use crate::fsops::{FsError, FsResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};

/// Name of the per-target engine directory holding staging space
pub const STAGING_DIR_NAME: &str = ".forker";

/// Suffix carried by every staging file; consumers must ignore it
pub const STAGING_SUFFIX: &str = ".forker-tmp";

/// Canonicalize a path, rejecting any symlink in the resolved chain
///
/// The path must exist. Each prefix of the absolute path is checked with
/// `symlink_metadata` before the final canonicalization, so a symlinked
/// ancestor fails the whole operation rather than silently escaping the
/// allowlist.
pub fn canonicalize_strict(path: &Path) -> FsResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut cursor = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                cursor.pop();
            }
            Component::CurDir => {}
            other => cursor.push(other.as_os_str()),
        }
        if cursor.as_os_str().is_empty() || cursor.parent().is_none() {
            continue;
        }
        match std::fs::symlink_metadata(&cursor) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(FsError::SymlinkRejected(cursor));
            }
            _ => {}
        }
    }

    Ok(std::fs::canonicalize(&absolute)?)
}

/// Require a canonical path to be a descendant of one of the roots
pub fn ensure_within_roots(path: &Path, roots: &[PathBuf]) -> FsResult<()> {
    if roots.iter().any(|root| path.starts_with(root)) {
        Ok(())
    } else {
        Err(FsError::PathOutsideRoot(path.to_path_buf()))
    }
}

/// Staging directory for a target root: `<base>/.forker/tmp`
pub fn staging_dir(target_base: &Path) -> PathBuf {
    target_base.join(STAGING_DIR_NAME).join("tmp")
}

/// Staging path for one job's copy to a target
///
/// `<base>/.forker/tmp/<job_id>/<file_name>.forker-tmp` — a dedicated
/// per-job directory keeps concurrent jobs for the same file name apart.
pub fn staging_path(target_base: &Path, job_id: &str, file_name: &str) -> PathBuf {
    staging_dir(target_base)
        .join(job_id)
        .join(format!("{}{}", file_name, STAGING_SUFFIX))
}

/// Whether a path names a staging artifact by suffix
pub fn is_staging_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

/// Compile include patterns into a glob set
pub fn build_glob_set(patterns: &[String]) -> FsResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_layout() {
        let path = staging_path(Path::new("/mnt/archive"), "job-1", "scan.dcm");
        assert_eq!(
            path,
            PathBuf::from("/mnt/archive/.forker/tmp/job-1/scan.dcm.forker-tmp")
        );
        assert!(is_staging_artifact(&path));
        assert!(!is_staging_artifact(Path::new("/mnt/archive/scan.dcm")));
    }

    #[test]
    fn test_confinement() {
        let roots = vec![PathBuf::from("/data/in"), PathBuf::from("/data/other")];
        assert!(ensure_within_roots(Path::new("/data/in/a/b.dcm"), &roots).is_ok());
        assert!(matches!(
            ensure_within_roots(Path::new("/etc/passwd"), &roots),
            Err(FsError::PathOutsideRoot(_))
        ));
        // A sibling with a shared string prefix is still outside
        assert!(ensure_within_roots(Path::new("/data/in-evil/x"), &roots).is_err());
    }

    #[test]
    fn test_glob_set_matches_patterns() {
        let set = build_glob_set(&["*.dcm".into(), "*.nii.gz".into()]).unwrap();
        assert!(set.is_match("scan.dcm"));
        assert!(set.is_match("volume.nii.gz"));
        assert!(!set.is_match("notes.txt"));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        assert!(build_glob_set(&["[".into()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_in_chain_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("f.dcm"), b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(canonicalize_strict(&real.join("f.dcm")).is_ok());
        assert!(matches!(
            canonicalize_strict(&link.join("f.dcm")),
            Err(FsError::SymlinkRejected(_))
        ));
    }
}
