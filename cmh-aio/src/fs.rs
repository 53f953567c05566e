// cmh-aio/src/fs.rs
// Primitive synchronous filesystem operations used by the module cache.
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use cmh_common::error::{CmhError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Creates a directory and all its parent components if they are missing.
pub fn create_dir_all(path: &Path) -> Result<()> {
    debug!("Creating directory recursively: {}", path.display());
    fs::create_dir_all(path).map_err(|e| {
        error!("Failed create dir {}: {}", path.display(), e);
        CmhError::from(e)
    })
}

/// Removes a directory and all its contents. A missing directory is not an
/// error.
pub fn remove_directory_recursive(path: &Path) -> Result<()> {
    debug!("Removing directory recursively: {}", path.display());
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("Failed remove dir_all {}: {}", path.display(), e);
            Err(CmhError::from(e))
        }
    }
}

/// Removes the empty parents of `path`, walking up until `stop_at` (which is
/// kept) or the first non-empty directory.
pub fn prune_empty_parents(path: &Path, stop_at: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        match fs::remove_dir(dir) {
            Ok(()) => debug!("Pruned empty directory {}", dir.display()),
            // Not empty, or already gone.
            Err(_) => break,
        }
        current = dir.parent();
    }
}

/// Moves a fully written directory into its final place.
///
/// Any existing directory at `to` is replaced. Both paths must live on the
/// same filesystem, so the final step is a single rename.
pub fn replace_directory(from: &Path, to: &Path) -> Result<()> {
    debug!("Moving {} into place at {}", from.display(), to.display());
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    if to.exists() {
        warn!("Replacing stale directory {}", to.display());
        remove_directory_recursive(to)?;
    }
    fs::rename(from, to).map_err(|e| {
        error!(
            "Failed to rename {} to {}: {}",
            from.display(),
            to.display(),
            e
        );
        CmhError::from(e)
    })
}

/// Atomically writes data to a file using a temporary file in the same
/// directory.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        CmhError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    let temp_path = temp_file.path().to_path_buf();
    debug!(
        "Atomically writing {} bytes to {} via temp file {}",
        content.len(),
        original_path.display(),
        temp_path.display()
    );

    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(original_path).map_err(|e| {
        error!(
            "Failed to persist temporary file {} over {}: {}",
            temp_path.display(),
            original_path.display(),
            e.error
        );
        CmhError::Io(Arc::new(e.error))
    })?;
    Ok(())
}

/// Total size in bytes of all regular files below `path`. Unreadable entries
/// are skipped.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry while sizing {}: {}", path.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nested/dir/file.txt");
        atomic_write_file(&target, b"first").unwrap();
        atomic_write_file(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn replace_directory_overwrites_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("staged");
        let target = tmp.path().join("final/fp");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("new.cmake"), "new").unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("old.cmake"), "old").unwrap();

        replace_directory(&staged, &target).unwrap();
        assert!(target.join("new.cmake").exists());
        assert!(!target.join("old.cmake").exists());
        assert!(!staged.exists());
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("one"), [0u8; 10]).unwrap();
        fs::write(tmp.path().join("a/b/two"), [0u8; 32]).unwrap();
        assert_eq!(dir_size(tmp.path()), 42);
    }

    #[test]
    fn prune_stops_at_root_and_at_non_empty_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("cache");
        let leaf = root.join("fmt/10.0.0/abc");
        fs::create_dir_all(&leaf).unwrap();
        fs::create_dir_all(root.join("fmt/9.0.0")).unwrap();
        fs::remove_dir(&leaf).unwrap();

        prune_empty_parents(&leaf, &root);
        assert!(!root.join("fmt/10.0.0").exists());
        assert!(root.join("fmt").exists());
        assert!(root.exists());
    }

    #[test]
    fn removing_a_missing_directory_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        remove_directory_recursive(&tmp.path().join("nope")).unwrap();
    }
}
