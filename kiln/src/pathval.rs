//! Path validation (§4.2): tamperability checks on trusted paths, and a
//! symlink-aware path resolver that never escapes a rootfs.

use std::fs;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// How thoroughly [`check_untamperable`] walks a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Check only the named path itself.
    Weak,
    /// Check every ancestor up to `/` and, if the path is a directory,
    /// every descendant.
    Strict,
}

const WORLD_OR_GROUP_WRITABLE: u32 = libc::S_IWGRP | libc::S_IWOTH;

/// Verifies that `path` (and, under [`Policy::Strict`], its ancestors and
/// descendants) is owned by uid 0 and not group- or world-writable.
///
/// Uses `symlink_metadata` throughout — a symlink anywhere on the path
/// fails the check rather than being silently followed, since a writable
/// symlink would let an unprivileged user redirect a trusted path.
pub fn check_untamperable(path: &Path, policy: Policy) -> Result<(), Error> {
    check_one(path)?;

    if policy == Policy::Weak {
        return Ok(());
    }

    for ancestor in path.ancestors().skip(1) {
        check_one(ancestor)?;
        if ancestor == Path::new("/") {
            break;
        }
    }

    let metadata = fs::symlink_metadata(path)
        .map_err(|e| Error::from(ErrorKind::Security(format!("{}: {e}", path.display()))))?;
    if metadata.is_dir() {
        check_descendants(path)?;
    }

    Ok(())
}

fn check_one(path: &Path) -> Result<(), Error> {
    let metadata = fs::symlink_metadata(path)
        .map_err(|e| Error::from(ErrorKind::Security(format!("{}: {e}", path.display()))))?;

    if metadata.uid() != 0 {
        return Err(Error::from(ErrorKind::Security(format!(
            "{} is not owned by root (uid {})",
            path.display(),
            metadata.uid()
        ))));
    }
    if metadata.mode() & WORLD_OR_GROUP_WRITABLE != 0 {
        return Err(Error::from(ErrorKind::Security(format!(
            "{} is group- or world-writable (mode {:o})",
            path.display(),
            metadata.mode() & 0o777
        ))));
    }
    Ok(())
}

fn check_descendants(dir: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::from(ErrorKind::Security(format!("{}: {e}", dir.display()))))?
    {
        let entry =
            entry.map_err(|e| Error::from(ErrorKind::Security(format!("{}: {e}", dir.display()))))?;
        let path = entry.path();
        check_one(&path)?;
        let metadata = fs::symlink_metadata(&path)
            .map_err(|e| Error::from(ErrorKind::Security(format!("{}: {e}", path.display()))))?;
        if metadata.is_dir() {
            check_descendants(&path)?;
        }
    }
    Ok(())
}

/// Resolves `path` (relative to `rootfs`) into an absolute, symlink-
/// resolved path that is guaranteed to stay inside `rootfs`.
///
/// Unlike [`std::fs::canonicalize`], a symlink target is re-joined against
/// `rootfs`, not the real filesystem root, so a symlink inside the rootfs
/// (however many `..` components it contains) can never walk outside of
/// it: a `..` that would cross above `rootfs` is clamped to `rootfs`
/// itself instead of erroring, matching how the kernel's own path walk
/// behaves inside a chroot.
///
/// When `trace` is `Some`, every symlink target encountered is appended to
/// it in resolution order.
pub fn realpath_within_rootfs(
    rootfs: &Path,
    path: &Path,
    mut trace: Option<&mut Vec<PathBuf>>,
) -> Result<PathBuf, Error> {
    let mut resolved = PathBuf::from("/");
    let mut pending: Vec<Component> = path.components().rev().collect();
    let mut symlink_budget = 40;

    while let Some(component) = pending.pop() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                let full = join_without_escaping(rootfs, &candidate);

                match fs::symlink_metadata(&full) {
                    Ok(metadata) if metadata.file_type().is_symlink() => {
                        symlink_budget -= 1;
                        if symlink_budget == 0 {
                            return Err(Error::from(ErrorKind::Security(format!(
                                "too many levels of symbolic links resolving {}",
                                path.display()
                            ))));
                        }
                        let target = fs::read_link(&full).map_err(|e| {
                            Error::from(ErrorKind::Security(format!("{}: {e}", full.display())))
                        })?;
                        if let Some(trace) = trace.as_deref_mut() {
                            trace.push(target.clone());
                        }
                        if target.is_absolute() {
                            pending.clear();
                            resolved = PathBuf::from("/");
                        }
                        for extra in target.components().rev() {
                            pending.push(extra);
                        }
                    }
                    _ => {
                        resolved = candidate;
                    }
                }
            }
        }
    }

    Ok(join_without_escaping(rootfs, &resolved))
}

/// Joins `rootfs` with an absolute, already-normalized `resolved` path,
/// clamping so the result can never leave `rootfs`.
fn join_without_escaping(rootfs: &Path, resolved: &Path) -> PathBuf {
    let relative = resolved.strip_prefix("/").unwrap_or(resolved);
    rootfs.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt as _};

    #[test]
    fn rejects_group_writable_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_mode(0o664);
        fs::set_permissions(&file, perms).unwrap();

        assert!(check_untamperable(&file, Policy::Weak).is_err());
    }

    #[test]
    fn resolves_plain_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let resolved =
            realpath_within_rootfs(dir.path(), Path::new("a/b"), None).unwrap();
        assert_eq!(resolved, dir.path().join("a/b"));
    }

    #[test]
    fn clamps_symlink_escape_attempt() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        symlink("../../../../../../etc", dir.path().join("a/escape")).unwrap();

        let resolved =
            realpath_within_rootfs(dir.path(), Path::new("a/escape/passwd"), None).unwrap();
        assert!(resolved.starts_with(dir.path()));
    }

    #[test]
    fn records_symlink_trace() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        symlink("real", dir.path().join("a/link")).unwrap();
        fs::write(dir.path().join("a/real"), b"x").unwrap();

        let mut trace = Vec::new();
        let resolved =
            realpath_within_rootfs(dir.path(), Path::new("a/link"), Some(&mut trace)).unwrap();
        assert_eq!(resolved, dir.path().join("a/real"));
        assert_eq!(trace, vec![PathBuf::from("real")]);
    }
}
