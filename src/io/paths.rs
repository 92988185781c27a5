//! Filesystem primitives shared across the build engine.

use std::collections::VecDeque;
use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use crate::ops::error::{GupError, Result};

/// Modification time of `path` in integer microseconds, taken from `lstat`
/// (symlinks are not dereferenced). `None` if the path does not exist.
pub fn get_mtime(path: &Path) -> Result<Option<i64>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta.mtime() * 1_000_000 + meta.mtime_nsec() / 1_000)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether `path` exists, without following a trailing symlink.
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Whether `path` is a directory, without following a trailing symlink.
pub fn is_dir_lstat(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_symlink())
        .unwrap_or(false)
}

/// Replace `dst` with `src` in a single rename; readers of `dst` see either
/// the old content or the new, never a mixture.
pub fn rename_atomic(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst)?;
    Ok(())
}

/// Remove a file, or a directory including its contents. Missing paths are
/// not an error.
pub fn try_remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            if is_dir_lstat(path) {
                fs::remove_dir_all(path)?;
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

/// Lexically normalize `path`: collapse `.` and resolve `..` where possible
/// without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Absolute, lexically-normalized form of `path` (relative paths are
/// anchored at the current directory).
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        normalize(&cwd.join(path))
    }
}

/// `canonicalize` with a lexical fallback for paths that don't (fully) exist.
pub fn realpath(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| absolutize(path))
}

/// The canonical identity of a target: its directory resolved through
/// symlinks, with the basename left untouched.
pub fn resolve_base(path: &Path) -> PathBuf {
    let abs = absolutize(path);
    match (abs.parent(), abs.file_name()) {
        (Some(dir), Some(name)) => realpath(dir).join(name),
        _ => abs,
    }
}

/// Lexical relative path from `base` to `path` (both are absolutized first).
pub fn relpath(path: &Path, base: &Path) -> PathBuf {
    let path = absolutize(path);
    let base = absolutize(base);
    let p: Vec<Component> = path.components().collect();
    let b: Vec<Component> = base.components().collect();
    let common = p
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for comp in &p[common..] {
        out.push(comp);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

const MAX_LINK_HOPS: usize = 40;

/// Walk `rel` from `base` one component at a time, recording the absolute
/// path of every symlink encountered before following it. Traversal stops at
/// the first non-existent suffix, which is appended verbatim to the result.
/// The final component is never dereferenced.
///
/// Callers register a dependency on each returned link so that retargeting
/// any link in the chain invalidates the target.
pub fn traverse_symlinks(base: &Path, rel: &Path) -> Result<(Vec<PathBuf>, PathBuf)> {
    let mut path = if rel.is_absolute() {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    let mut parts: VecDeque<_> = rel
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .map(|c| c.as_os_str().to_os_string())
        .collect();

    let mut links = Vec::new();
    if parts.is_empty() {
        return Ok((links, path));
    }

    let mut hops = 0;
    loop {
        match fs::read_link(&path) {
            Ok(dest) => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(GupError::Safe(format!(
                        "Too many levels of symbolic links: {}",
                        path.display()
                    )));
                }
                links.push(path.clone());
                path = if dest.is_absolute() {
                    dest
                } else {
                    path.parent().unwrap_or(Path::new("/")).join(dest)
                };
            }
            Err(e) => match e.raw_os_error() {
                // not a symlink; step into the next component
                Some(libc::EINVAL) => match parts.pop_front() {
                    Some(part) => {
                        path.push(part);
                        if parts.is_empty() {
                            return Ok((links, path));
                        }
                    }
                    None => return Ok((links, path)),
                },
                // nothing left to resolve; return the remaining suffix as-is
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => {
                    for part in parts {
                        path.push(part);
                    }
                    return Ok((links, path));
                }
                _ => return Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn mtime_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(get_mtime(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn mtime_is_microseconds() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "x").unwrap();
        let mtime = get_mtime(&f).unwrap().unwrap();
        let secs = fs::symlink_metadata(&f).unwrap().mtime();
        assert_eq!(mtime / 1_000_000, secs);
    }

    #[test]
    fn try_remove_handles_files_dirs_and_missing() {
        let dir = tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "x").unwrap();
        try_remove(&f).unwrap();
        assert!(!f.exists());

        let d = dir.path().join("d");
        fs::create_dir_all(d.join("nested")).unwrap();
        fs::write(d.join("nested/file"), "x").unwrap();
        try_remove(&d).unwrap();
        assert!(!d.exists());

        try_remove(&dir.path().join("never-existed")).unwrap();
    }

    #[test]
    fn rename_atomic_replaces_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old").unwrap();
        rename_atomic(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
        assert!(!src.exists());
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), Path::new("/a/c/d"));
        assert_eq!(normalize(Path::new("/..")), Path::new("/"));
        assert_eq!(normalize(Path::new("a/../..")), Path::new(".."));
    }

    #[test]
    fn relpath_walks_up_and_down() {
        assert_eq!(relpath(Path::new("/a/b/c"), Path::new("/a")), Path::new("b/c"));
        assert_eq!(
            relpath(Path::new("/a/x"), Path::new("/a/b/c")),
            Path::new("../../x")
        );
        assert_eq!(relpath(Path::new("/a"), Path::new("/a")), Path::new("."));
    }

    #[test]
    fn traverse_records_each_link_in_the_chain() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        fs::create_dir(base.join("real")).unwrap();
        fs::write(base.join("real/file"), "x").unwrap();
        symlink("real", base.join("l1")).unwrap();
        symlink("l1", base.join("l2")).unwrap();

        let (links, final_path) =
            traverse_symlinks(base, Path::new("l2/file")).unwrap();
        assert_eq!(links, vec![base.join("l2"), base.join("l1")]);
        assert_eq!(final_path, base.join("real/file"));
    }

    #[test]
    fn traverse_keeps_missing_suffix() {
        let dir = tempdir().unwrap();
        let (links, final_path) =
            traverse_symlinks(dir.path(), Path::new("no/such/sub")).unwrap();
        assert!(links.is_empty());
        assert_eq!(final_path, dir.path().join("no/such/sub"));
    }

    #[test]
    fn traverse_does_not_dereference_the_final_component() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        fs::write(base.join("file"), "x").unwrap();
        symlink("file", base.join("link")).unwrap();

        let (links, final_path) = traverse_symlinks(base, Path::new("link")).unwrap();
        assert!(links.is_empty());
        assert_eq!(final_path, base.join("link"));
    }
}
