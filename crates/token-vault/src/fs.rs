//! Atomic file helpers
//!
//! All writes go to a temp file in the target's directory and are then
//! renamed over the target, so a crash mid-write leaves either the old file
//! or the new one, never a truncated mix. Files are created `0600` on unix
//! because they hold key material or encrypted credentials.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Directory that will hold `path`, treating a bare filename as `.`.
fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Write `contents` to `path` atomically, creating parent directories.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating directory {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("path {} has no file name", path.display())))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp file {}: {e}", tmp_path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting permissions on {}: {e}", tmp_path.display())))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temp file");
        }
        return Err(Error::Io(format!(
            "renaming temp file over {}: {e}",
            path.display()
        )));
    }

    debug!(path = %path.display(), bytes = contents.len(), "atomic write complete");
    Ok(())
}

/// Read a file, mapping "not found" to `Ok(None)`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(format!("reading {}: {e}", path.display()))),
    }
}

/// Size of a file in bytes, `0` if it does not exist yet.
pub async fn file_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::Io(format!("stat {}: {e}", path.display()))),
    }
}
