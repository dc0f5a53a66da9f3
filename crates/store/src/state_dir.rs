//! State-directory resolution.
//!
//! Order: `$OPENCLAW_STATE_DIR`, else `$OPENCLAW_HOME/.openclaw`, else
//! `$HOME/.openclaw`, else a uid-suffixed temp subdir. The temp fallback
//! is only acceptable when the directory is owned by the current uid, is
//! not a symlink, and is not group/other-writable; anything else is
//! refused and replaced.

use std::path::{Path, PathBuf};

use oc_domain::error::{Error, Result};

/// Resolve the state directory, creating it when missing.
pub fn resolve_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env_path("OPENCLAW_STATE_DIR") {
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    if let Some(home) = env_path("OPENCLAW_HOME") {
        let dir = home.join(".openclaw");
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    if let Some(home) = env_path("HOME") {
        let dir = home.join(".openclaw");
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }
    temp_fallback_dir()
}

fn env_path(name: &str) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}

/// `$TMPDIR/openclaw-<uid>` (or `/tmp/openclaw-<uid>`), hardened.
fn temp_fallback_dir() -> Result<PathBuf> {
    let base = std::env::var("TMPDIR")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    let uid = current_uid();
    let dir = base.join(format!("openclaw-{uid}"));

    match ensure_private_dir(&dir, uid) {
        Ok(()) => Ok(dir),
        Err(reason) => {
            // A symlinked or foreign-owned dir is an attack surface, not a
            // recoverable state: remove and recreate.
            tracing::warn!(
                dir = %dir.display(),
                reason = %reason,
                "replacing unsafe temp state dir"
            );
            remove_whatever(&dir)?;
            ensure_private_dir(&dir, uid)
                .map_err(|r| Error::Integrity(format!("temp state dir {}: {r}", dir.display())))?;
            Ok(dir)
        }
    }
}

/// Create `dir` if needed and verify it is a private directory owned by
/// `uid`. Returns a human-readable refusal reason on failure.
fn ensure_private_dir(dir: &Path, uid: u32) -> std::result::Result<(), String> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| format!("create failed: {e}"))?;
        set_mode_0700(dir).map_err(|e| format!("chmod failed: {e}"))?;
    }

    let meta = std::fs::symlink_metadata(dir).map_err(|e| format!("stat failed: {e}"))?;
    if meta.file_type().is_symlink() {
        return Err("is a symlink".into());
    }
    if !meta.is_dir() {
        return Err("not a directory".into());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta.uid() != uid {
            return Err(format!("owned by uid {} (expected {uid})", meta.uid()));
        }
        if meta.mode() & 0o022 != 0 {
            return Err(format!(
                "group/other-writable (mode {:o})",
                meta.mode() & 0o777
            ));
        }
    }

    Ok(())
}

fn remove_whatever(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode_0700(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_mode_0700(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // Safety: getuid is always safe to call.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var driven tests mutate process state; keep them in one test so
    // they cannot race each other.
    #[test]
    fn resolution_order() {
        let explicit = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        std::env::set_var("OPENCLAW_STATE_DIR", explicit.path());
        std::env::set_var("OPENCLAW_HOME", home.path());
        let dir = resolve_state_dir().unwrap();
        assert_eq!(dir, explicit.path());

        std::env::remove_var("OPENCLAW_STATE_DIR");
        let dir = resolve_state_dir().unwrap();
        assert_eq!(dir, home.path().join(".openclaw"));
        assert!(dir.is_dir());

        std::env::remove_var("OPENCLAW_HOME");
    }

    #[cfg(unix)]
    #[test]
    fn unsafe_temp_dir_replaced() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let uid = current_uid();
        let dir = base.path().join(format!("openclaw-{uid}"));

        // World-writable dir must be refused and recreated private.
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).unwrap();
        assert!(ensure_private_dir(&dir, uid).is_err());

        remove_whatever(&dir).unwrap();
        ensure_private_dir(&dir, uid).unwrap();
        let meta = std::fs::metadata(&dir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_temp_dir_refused() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("real");
        std::fs::create_dir(&target).unwrap();
        let link = base.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = ensure_private_dir(&link, current_uid()).unwrap_err();
        assert!(err.contains("symlink"), "got: {err}");
    }
}
