// Owner-only file handling for session and config files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` readable only by the current user. A parent
/// directory created here is restricted too; an existing one keeps its mode.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory `{}`", parent.display()))?;
            ensure_owner_only_dir(parent)?;
        }
    }

    let staging = path.with_extension("tmp");
    fs::write(&staging, contents)
        .with_context(|| format!("failed to write `{}`", staging.display()))?;
    ensure_owner_only_file(&staging)?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to move `{}` into place", path.display()))
}

/// Remove `path`; a missing file is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to remove `{}`", path.display())),
    }
}

pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    set_mode_if_needed(path, 0o600)
}

pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    set_mode_if_needed(path, 0o700)
}

fn set_mode_if_needed(path: &Path, wanted: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != wanted {
            fs::set_permissions(path, fs::Permissions::from_mode(wanted))
                .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, wanted);
    }

    Ok(())
}
