//! Workspace materializer (gzip-tar extraction with path-traversal defense
//! and optional read-only sealing) and the Linux entropy injector.

use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use tar::EntryType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("path escape: entry {0:?} would land outside the workspace root")]
    PathEscape(PathBuf),
    #[error("symlink entry {0:?} is not supported in a workspace archive")]
    Symlink(PathBuf),
}

/// Fixed mount path for a materialized workspace inside the sandbox.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Extract a gzip-compressed tar byte string into `dest_root`, replacing
/// whatever tree (if any) is already there.
pub fn materialize(tar_gz: &[u8], dest_root: &Path) -> Result<(), WorkspaceError> {
    if dest_root.exists() {
        fs::remove_dir_all(dest_root)?;
    }
    fs::create_dir_all(dest_root)?;
    fs::set_permissions(dest_root, fs::Permissions::from_mode(0o755))?;

    let decoder = GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        let clean = checked_relative_path(&relative)?;
        let target = dest_root.join(&clean);

        match entry.header().entry_type() {
            EntryType::Directory => {
                let mode = entry.header().mode().unwrap_or(0o755);
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                fs::write(&target, &buf)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                return Err(WorkspaceError::Symlink(relative));
            }
            _ => {
                // Devices, fifos, and other special entry types are skipped.
                tracing::debug!(path = %relative.display(), "skipping unsupported tar entry type");
            }
        }
    }

    Ok(())
}

/// If `access` is (case-insensitively) `"ro"`, walk the materialized tree
/// and strip all write bits, leaving traversal/read bits intact.
pub fn seal_if_readonly(dest_root: &Path, access: Option<&str>) -> Result<(), WorkspaceError> {
    let is_ro = access.map(|a| a.eq_ignore_ascii_case("ro")).unwrap_or(false);
    if !is_ro {
        return Ok(());
    }
    seal_readonly_recursive(dest_root)
}

fn seal_readonly_recursive(path: &Path) -> Result<(), WorkspaceError> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o555))?;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            seal_readonly_recursive(&entry.path())?;
        }
    } else {
        fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    }
    Ok(())
}

/// Clean a tar entry path and verify it cannot walk above the extraction
/// root via `..` components, without ever touching the filesystem (the
/// target may not exist yet).
fn checked_relative_path(entry_path: &Path) -> Result<PathBuf, WorkspaceError> {
    let mut depth: i64 = 0;
    let mut cleaned = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                cleaned.push(part);
            }
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(WorkspaceError::PathEscape(entry_path.to_path_buf()));
                }
                cleaned.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(WorkspaceError::PathEscape(entry_path.to_path_buf()));
            }
        }
    }
    Ok(cleaned)
}

#[derive(Debug, Error)]
pub enum EntropyError {
    #[error("entropy ioctl failed: {0}")]
    Ioctl(io::Error),
}

/// Best-effort seeding of the guest kernel RNG: write the raw bytes to
/// `/dev/urandom` (failure ignored), then on Linux credit them via the
/// add-entropy ioctl. The ioctl's failure is returned, not ignored, but the
/// caller is expected to treat it as non-fatal to the execution.
pub fn seed_entropy(seed: &[u8]) -> Result<(), EntropyError> {
    if let Ok(mut f) = fs::OpenOptions::new().write(true).open("/dev/urandom") {
        let _ = f.write_all(seed);
    }
    #[cfg(target_os = "linux")]
    {
        add_entropy_credit_linux(seed)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = seed;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn add_entropy_credit_linux(seed: &[u8]) -> Result<(), EntropyError> {
    use std::os::unix::io::AsRawFd;

    // _IOW('R', 0x03, struct rand_pool_info); struct rand_pool_info is a
    // variable-length { entropy_count: i32, buf_size: i32, buf: [u8; buf_size] }.
    const RNDADDENTROPY: libc::c_ulong = 0x4008_5203;

    let file = fs::OpenOptions::new()
        .write(true)
        .open("/dev/random")
        .map_err(EntropyError::Ioctl)?;

    let entropy_bits = (seed.len() as i32).saturating_mul(8);
    let mut payload = Vec::with_capacity(8 + seed.len());
    payload.extend_from_slice(&entropy_bits.to_ne_bytes());
    payload.extend_from_slice(&(seed.len() as i32).to_ne_bytes());
    payload.extend_from_slice(seed);

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), RNDADDENTROPY, payload.as_ptr()) };
    if ret < 0 {
        Err(EntropyError::Ioctl(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn build_tar_gz(entries: &[(&str, &[u8], u32, bool)]) -> Vec<u8> {
        // entries: (path, content, mode, is_dir)
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content, mode, is_dir) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(*mode);
            if *is_dir {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, path, &b""[..]).unwrap();
            } else {
                header.set_entry_type(EntryType::Regular);
                header.set_size(content.len() as u64);
                if path.contains("..") {
                    // `Builder::append_data` validates the path and rejects
                    // `..` components, so write the raw name bytes directly
                    // to construct a path-escaping archive for the test.
                    let name = header.as_gnu_mut().unwrap().name.as_mut();
                    name[..path.len()].copy_from_slice(path.as_bytes());
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                } else {
                    header.set_cksum();
                    builder.append_data(&mut header, path, *content).unwrap();
                }
            }
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    #[test]
    fn materializes_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let archive = build_tar_gz(&[
            ("sub/", &[], 0o755, true),
            ("sub/hello.txt", b"hi\n", 0o644, false),
        ]);
        materialize(&archive, &root).unwrap();
        assert_eq!(fs::read(root.join("sub/hello.txt")).unwrap(), b"hi\n");
    }

    #[test]
    fn rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let archive = build_tar_gz(&[("../../etc/passwd", b"pwned", 0o644, false)]);
        let err = materialize(&archive, &root).unwrap_err();
        assert!(matches!(err, WorkspaceError::PathEscape(_)));
    }

    #[test]
    fn rejects_symlink_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "link", "/etc/passwd")
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar_bytes).unwrap();
        let archive = gz.finish().unwrap();

        let err = materialize(&archive, &root).unwrap_err();
        assert!(matches!(err, WorkspaceError::Symlink(_)));
    }

    #[test]
    fn seals_read_only_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let archive = build_tar_gz(&[
            ("sub/", &[], 0o755, true),
            ("sub/hello.txt", b"hi\n", 0o644, false),
        ]);
        materialize(&archive, &root).unwrap();
        seal_if_readonly(&root, Some("RO")).unwrap();

        let file_mode = fs::metadata(root.join("sub/hello.txt"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        let dir_mode = fs::metadata(root.join("sub"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o444);
        assert_eq!(dir_mode, 0o555);
    }

    #[test]
    fn non_ro_access_leaves_permissions_alone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let archive = build_tar_gz(&[("hello.txt", b"hi\n", 0o644, false)]);
        materialize(&archive, &root).unwrap();
        seal_if_readonly(&root, Some("rw")).unwrap();
        let mode = fs::metadata(root.join("hello.txt")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}
