//! Hardened archive extraction for skill installs.
//!
//! Skill packs arrive as `.tgz` files and unpack under
//! `tools/<skill>/` in the state dir. Every entry path is normalized and
//! checked before any file is created: absolute paths, `..` traversal
//! (including paths that climb after `strip_components`), symlink and
//! hardlink entries, and non-UTF8 names are all refused, and the whole
//! extraction is rejected — no partial output outside the target can
//! ever exist.

use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use oc_domain::error::{Error, Result};

/// Max component depth per entry; caps pathological nesting.
const MAX_PATH_DEPTH: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Target containment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Join `rel` onto `root`, refusing any path that would escape it.
///
/// Used for skill `targetDir` resolution: the target must stay inside its
/// skill root even when the manifest supplies a relative path.
pub fn resolve_in_root(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(Error::Validation(format!(
            "target '{rel}' must be relative"
        )));
    }
    let mut depth = 0i64;
    for comp in rel_path.components() {
        match comp {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::Validation(format!(
                        "target '{rel}' escapes its skill root"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Validation(format!(
                    "target '{rel}' must be relative"
                )));
            }
        }
    }
    Ok(root.join(rel_path))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract `tgz_path` into `target_dir`, dropping the first
/// `strip_components` path components of every entry.
pub fn safe_extract_tgz(
    tgz_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    // Phase 1: validate every entry before creating anything.
    walk_entries(tgz_path, |entry_type, path| {
        reject_bad_entry(entry_type, path)?;
        // Entries fully consumed by stripping are allowed (top-level dir).
        let _ = normalize_entry(path, strip_components)?;
        Ok(())
    })?;

    // Phase 2: extract with hardened file creation.
    let file = std::fs::File::open(tgz_path)?;
    let gz = GzDecoder::new(io::BufReader::new(file));
    let mut archive = Archive::new(gz);

    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let entry_type = entry.header().entry_type();
        if is_metadata_entry(entry_type) {
            continue;
        }

        let raw = entry.path().map_err(tar_err)?.into_owned();
        let Some(rel) = normalize_entry(&raw, strip_components)? else {
            continue;
        };
        let dest = target_dir.join(&rel);

        match entry_type {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
            }
            _ => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // create_new: never overwrite, never follow a pre-existing
                // symlink at the destination.
                let mut out = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&dest)
                    .map_err(|e| {
                        Error::Integrity(format!(
                            "archive collision at {}: {e}",
                            rel.display()
                        ))
                    })?;
                io::copy(&mut entry, &mut out)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    // Strip setuid/setgid/sticky.
                    let mode = entry.header().mode().unwrap_or(0o644) & 0o777;
                    std::fs::set_permissions(
                        &dest,
                        std::fs::Permissions::from_mode(mode),
                    )?;
                }
            }
        }
    }

    Ok(())
}

fn walk_entries(
    tgz_path: &Path,
    mut check: impl FnMut(tar::EntryType, &Path) -> Result<()>,
) -> Result<()> {
    let file = std::fs::File::open(tgz_path)?;
    let gz = GzDecoder::new(io::BufReader::new(file));
    let mut archive = Archive::new(gz);

    for entry in archive.entries().map_err(tar_err)? {
        let entry = entry.map_err(tar_err)?;
        let entry_type = entry.header().entry_type();
        if is_metadata_entry(entry_type) {
            continue;
        }
        let path = entry.path().map_err(tar_err)?.into_owned();
        check(entry_type, &path)?;
    }
    Ok(())
}

fn is_metadata_entry(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
            | tar::EntryType::GNULongName
            | tar::EntryType::GNULongLink
    )
}

fn reject_bad_entry(entry_type: tar::EntryType, path: &Path) -> Result<()> {
    match entry_type {
        tar::EntryType::Regular | tar::EntryType::GNUSparse | tar::EntryType::Directory => Ok(()),
        tar::EntryType::Symlink | tar::EntryType::Link => Err(Error::Integrity(format!(
            "symlink/hardlink entry in archive: {}",
            path.display()
        ))),
        other => Err(Error::Integrity(format!(
            "unsupported archive entry type {other:?}: {}",
            path.display()
        ))),
    }
}

/// Normalize an entry path: strip `.`, refuse `..`/absolute/prefix
/// components and non-UTF8 names, then drop `strip` leading components.
/// Returns `None` when stripping consumes the whole path.
fn normalize_entry(path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(s) => {
                let s = s.to_str().ok_or_else(|| {
                    Error::Integrity(format!("non-UTF8 path in archive: {}", path.display()))
                })?;
                parts.push(s);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::Integrity(format!(
                    "parent-dir traversal in archive: {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Integrity(format!(
                    "absolute path in archive: {}",
                    path.display()
                )));
            }
        }
    }
    if parts.len() > MAX_PATH_DEPTH {
        return Err(Error::Integrity(format!(
            "path depth {} exceeds {MAX_PATH_DEPTH}: {}",
            parts.len(),
            path.display()
        )));
    }
    if parts.len() <= strip {
        return Ok(None);
    }
    Ok(Some(parts[strip..].iter().collect()))
}

fn tar_err(e: io::Error) -> Error {
    Error::Integrity(format!("archive read failed: {e}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_tgz(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let gz = GzEncoder::new(tmp.as_file(), Compression::fast());
        let mut builder = tar::Builder::new(gz);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, path, &data[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        tmp
    }

    /// The tar crate refuses to build `..` paths, so craft the header raw.
    fn make_tgz_raw(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let gz = GzEncoder::new(tmp.as_file(), Compression::fast());
        let mut out = io::BufWriter::new(gz);
        for (path, data) in entries {
            let mut hdr = [0u8; 512];
            let name = path.as_bytes();
            hdr[..name.len().min(100)].copy_from_slice(&name[..name.len().min(100)]);
            hdr[100..108].copy_from_slice(b"0000644\0");
            hdr[108..116].copy_from_slice(b"0001000\0");
            hdr[116..124].copy_from_slice(b"0001000\0");
            let size = format!("{:011o}\0", data.len());
            hdr[124..136].copy_from_slice(size.as_bytes());
            hdr[136..148].copy_from_slice(b"00000000000\0");
            hdr[156] = b'0';
            hdr[257..263].copy_from_slice(b"ustar\0");
            hdr[263..265].copy_from_slice(b"00");
            hdr[148..156].copy_from_slice(b"        ");
            let cksum: u32 = hdr.iter().map(|&b| b as u32).sum();
            let cksum_str = format!("{cksum:06o}\0 ");
            hdr[148..156].copy_from_slice(&cksum_str.as_bytes()[..8]);
            out.write_all(&hdr).unwrap();
            out.write_all(data).unwrap();
            let rem = data.len() % 512;
            if rem != 0 {
                out.write_all(&vec![0u8; 512 - rem]).unwrap();
            }
        }
        out.write_all(&[0u8; 1024]).unwrap();
        out.into_inner().unwrap().finish().unwrap();
        tmp
    }

    #[test]
    fn clean_archive_extracts() {
        let tgz = make_tgz(&[("pack/SKILL.md", b"# skill"), ("pack/bin/run", b"#!/bin/sh")]);
        let dest = tempfile::tempdir().unwrap();
        safe_extract_tgz(tgz.path(), dest.path(), 1).unwrap();
        assert!(dest.path().join("SKILL.md").exists());
        assert!(dest.path().join("bin/run").exists());
    }

    #[test]
    fn traversal_rejected_before_any_output() {
        let tgz = make_tgz_raw(&[("ok.txt", b"fine"), ("../x", b"escape")]);
        let dest = tempfile::tempdir().unwrap();
        assert!(safe_extract_tgz(tgz.path(), dest.path(), 0).is_err());
        // Validation happens before extraction: even the clean entry must
        // not have been written.
        assert!(!dest.path().join("ok.txt").exists());
    }

    #[test]
    fn traversal_after_strip_rejected() {
        // "a/../../x" still contains ParentDir components — refused outright,
        // stripping never launders them.
        let tgz = make_tgz_raw(&[("a/../../x", b"escape")]);
        let dest = tempfile::tempdir().unwrap();
        assert!(safe_extract_tgz(tgz.path(), dest.path(), 1).is_err());
    }

    #[test]
    fn symlink_entry_rejected() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let gz = GzEncoder::new(tmp.as_file(), Compression::fast());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder.append_link(&mut header, "pack/evil", "/etc").unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let err = safe_extract_tgz(tmp.path(), dest.path(), 0).unwrap_err();
        assert!(err.to_string().contains("symlink"), "got: {err}");
    }

    #[test]
    fn absolute_path_rejected() {
        let tgz = make_tgz_raw(&[("/etc/passwd", b"root")]);
        let dest = tempfile::tempdir().unwrap();
        assert!(safe_extract_tgz(tgz.path(), dest.path(), 0).is_err());
    }

    #[test]
    fn existing_file_never_overwritten() {
        let tgz = make_tgz(&[("pack/data.txt", b"new")]);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("data.txt"), b"old").unwrap();
        assert!(safe_extract_tgz(tgz.path(), dest.path(), 1).is_err());
        assert_eq!(
            std::fs::read(dest.path().join("data.txt")).unwrap(),
            b"old"
        );
    }

    #[cfg(unix)]
    #[test]
    fn setuid_bit_stripped() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let gz = GzEncoder::new(tmp.as_file(), Compression::fast());
        let mut builder = tar::Builder::new(gz);
        let data = b"#!/bin/sh";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o4755);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, "pack/tool", &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        safe_extract_tgz(tmp.path(), dest.path(), 1).unwrap();
        let mode = std::fs::metadata(dest.path().join("tool"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn resolve_in_root_contains() {
        let root = Path::new("/state/tools/gmail");
        assert_eq!(
            resolve_in_root(root, "bin/fetch").unwrap(),
            root.join("bin/fetch")
        );
        assert!(resolve_in_root(root, "../other").is_err());
        assert!(resolve_in_root(root, "a/../../b").is_err());
        assert!(resolve_in_root(root, "/abs").is_err());
        // Dipping below and coming back up is fine.
        assert!(resolve_in_root(root, "a/../b").is_ok());
    }
}
