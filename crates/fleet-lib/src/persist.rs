//! All-or-nothing file writes

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Write `data` to `path` through a sibling temp file and an atomic rename.
///
/// Readers see either the previous content or the new one, never a mix.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    write_atomic_inner(path, data, None)
}

/// Like [`write_atomic`], but the file is readable by its owner only from the
/// moment it is created.
pub fn write_atomic_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    write_atomic_inner(path, data, Some(0o600))
}

fn write_atomic_inner(path: &Path, data: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(&temp_path)?;

    // A temp file left over from an earlier crash keeps its old mode
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(data)?;
    file.sync_all()?;

    std::fs::rename(&temp_path, path)
}
