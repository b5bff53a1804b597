//! Private key file checks

use std::path::Path;

use crate::error::KeyFileError;

/// Verify the key file before handing it to the SSH client.
///
/// With `check_permissions` on a unix target, an existing key whose mode
/// grants anything to group or other is rejected. A missing key is always
/// `NotFound`.
pub fn check_key_file(path: &Path, check_permissions: bool) -> Result<(), KeyFileError> {
    if check_permissions && path.exists() {
        check_mode(path)?;
    }
    if !path.is_file() {
        return Err(KeyFileError::NotFound(path.display().to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn check_mode(path: &Path) -> Result<(), KeyFileError> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(KeyFileError::Insecure {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

// Permission bits are not meaningful here
#[cfg(not(unix))]
fn check_mode(_path: &Path) -> Result<(), KeyFileError> {
    Ok(())
}
