// cmh-aio/src/checksum.rs
use std::path::Path;

use cmh_common::error::{CmhError, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

/// Content digest of a directory tree.
///
/// Covers every regular file's path relative to `root` and its bytes, walked
/// in name order so the result does not depend on directory listing order.
/// Top-level entries named in `exclude` are left out.
pub fn tree_digest(root: &Path, exclude: &[&str]) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut files = 0usize;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !exclude
                    .iter()
                    .any(|name| entry.file_name() == std::ffi::OsStr::new(name))
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            CmhError::Checksum(format!("cannot walk {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut reader = std::io::BufReader::new(std::fs::File::open(entry.path())?);
        std::io::copy(&mut reader, &mut hasher)?;
        hasher.update([0u8]);
        files += 1;
    }

    let digest = hex::encode(hasher.finalize());
    debug!("Tree digest of {} over {} files: {}", root.display(), files, digest);
    Ok(digest)
}
