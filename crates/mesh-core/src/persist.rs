use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MeshError;

/// Serializes `value` as JSON and writes it atomically: encode, write to
/// `path` with a `.tmp` extension, then `fs::rename` over the real path.
/// A reader never observes a partially-written file.
pub fn save_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), MeshError> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| MeshError::Io(format!("encode {}: {err}", path.display())))?;
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| MeshError::Io(format!("create_dir_all {}: {err}", parent.display())))?;
        }
    }
    fs::write(&tmp, &bytes).map_err(|err| MeshError::Io(format!("write {}: {err}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|err| MeshError::Io(format!("rename {}: {err}", path.display())))?;
    restrict_permissions(path)?;
    Ok(())
}

/// Loads and decodes a JSON file written by [`save_json_atomic`].
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, MeshError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| MeshError::Io(format!("read {}: {err}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|err| MeshError::Io(format!("decode {}: {err}", path.display())))
}

/// Loads a JSON file if it exists, otherwise returns `T::default()`; a
/// missing persistence file is normal on first run, not an error.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> Result<T, MeshError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(T::default());
    }
    load_json(path)
}

/// Restricts `path` to owner read/write only (Unix mode 0600). Best effort
/// on non-Unix targets, where the underlying filesystem has no equivalent
/// permission bit.
pub fn restrict_permissions(path: impl AsRef<Path>) -> Result<(), MeshError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = path.as_ref();
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .map_err(|err| MeshError::Io(format!("chmod {}: {err}", path.display())))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
