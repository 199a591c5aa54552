use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{BootstrapError, Result};

pub(crate) const PRIVATE_FILE_MODE: u32 = 0o600;

/// Atomically replaces `path` with `contents`, readable by the owner only.
///
/// The data is written to a sibling temporary file, synced, and renamed over
/// the target, so a crash leaves either the old file or the new one.
///
/// # Errors
/// Returns an error if the parent directory cannot be created, or the
/// temporary file cannot be written, synced or renamed.
pub async fn write_private_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| BootstrapError::io(format!("Failed to create {}", parent.display()), e))?;

    let tmp_path = temp_path(path);
    let result = write_synced(&tmp_path, contents).await;
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    fs::rename(&tmp_path, path).await.map_err(|e| {
        BootstrapError::io(
            format!(
                "Failed to move {} into place at {}",
                tmp_path.display(),
                path.display()
            ),
            e,
        )
    })?;
    Ok(())
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let context = || format!("Failed to write {}", path.display());
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_FILE_MODE)
        .open(path)
        .await
        .map_err(|e| BootstrapError::io(context(), e))?;
    // `mode` only applies on creation; a stale temp file keeps its old bits.
    fs::set_permissions(path, std::fs::Permissions::from_mode(PRIVATE_FILE_MODE))
        .await
        .map_err(|e| BootstrapError::io(context(), e))?;
    file.write_all(contents)
        .await
        .map_err(|e| BootstrapError::io(context(), e))?;
    file.sync_all()
        .await
        .map_err(|e| BootstrapError::io(context(), e))?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(format!(".tmp-{}", std::process::id()));
    parent_dir(path).join(name)
}
