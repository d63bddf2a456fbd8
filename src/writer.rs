use std::fs::{self, Permissions};
use std::io::Write;
use std::path::Path;

use anyhow::Context;

/// Write `content` to `dest`, creating parent directories, then give `dest` the
/// permission bits of `source`.
///
/// The content lands through a temp file in the destination directory that is renamed
/// into place, so readers never observe a partial artifact.
pub fn write_text(source: &Path, dest: &Path, content: &str) -> anyhow::Result<Permissions> {
    write_atomic(dest, content.as_bytes())?;
    replicate_permissions(source, dest)
}

/// Copy the raw bytes of `source` to `dest`, creating parent directories, then give
/// `dest` the permission bits of `source`.
pub fn copy_raw(source: &Path, dest: &Path) -> anyhow::Result<Permissions> {
    let bytes = fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
    write_atomic(dest, &bytes)?;
    replicate_permissions(source, dest)
}

/// Apply the permission bits of `source` to `dest`.
pub fn replicate_permissions(source: &Path, dest: &Path) -> anyhow::Result<Permissions> {
    let permissions = fs::metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?
        .permissions();
    fs::set_permissions(dest, permissions.clone())
        .with_context(|| format!("failed to set permissions on {}", dest.display()))?;
    Ok(permissions)
}

/// Permission bits in their numeric form, for logs and summaries.
#[cfg(unix)]
pub fn mode_bits(permissions: &Permissions) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    permissions.mode() & 0o7777
}

#[cfg(not(unix))]
pub fn mode_bits(permissions: &Permissions) -> u32 {
    if permissions.readonly() { 0o444 } else { 0o666 }
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    tmp.as_file().flush()?;
    tmp.persist(dest)
        .with_context(|| format!("failed to move output into {}", dest.display()))?;
    Ok(())
}
