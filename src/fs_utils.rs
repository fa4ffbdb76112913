//! Filesystem helpers shared by the merge, executor and finalizer.
//!
//! Everything that writes into the shared output tree goes through here, so the
//! rules live in one place:
//!
//! - relative paths are normalized (lowercase, `/` separators) and may never
//!   escape the root;
//! - destination files are replaced, never written in place, so a hard link
//!   into a mod directory can't be used to modify the mod's own copy.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("path escapes its root: {0}")]
    UnsafePath(PathBuf),
}

/// How a file reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placed {
    HardLinked,
    Copied,
}

/// Normalize a path relative to a source root into the merged-tree key.
///
/// Bethesda paths are case-insensitive, so keys are lowercase with `/`
/// separators. Absolute paths and `..` components are rejected.
pub fn normalize_relative(rel: &Path) -> Result<String, FsError> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_lowercase()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::UnsafePath(rel.to_path_buf()));
            }
        }
    }
    if parts.is_empty() {
        return Err(FsError::UnsafePath(rel.to_path_buf()));
    }
    Ok(parts.join("/"))
}

/// Join a normalized key onto a root, re-checking that it stays inside.
pub fn safe_join(root: &Path, key: &str) -> Result<PathBuf, FsError> {
    let rel = Path::new(key);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(FsError::UnsafePath(rel.to_path_buf()));
    }
    Ok(root.join(rel))
}

/// Place `src` at `dest`, replacing whatever is there.
///
/// Prefers a hard link when asked and possible (same filesystem), falling back
/// to a copy.
pub fn place_file(src: &Path, dest: &Path, prefer_hardlink: bool) -> io::Result<Placed> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if prefer_hardlink && fs::hard_link(src, dest).is_ok() {
        return Ok(Placed::HardLinked);
    }
    fs::copy(src, dest)?;
    Ok(Placed::Copied)
}

/// Move `src` over `dest` by rename, falling back to copy + delete across
/// filesystems.
pub fn move_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    copy_over(src, dest)?;
    fs::remove_file(src)
}

/// Copy `src` into a fresh temp file beside `dest`, then rename it over `dest`.
///
/// The temp file is unique and removed on failure, so no sibling asset can
/// be clobbered and a partial copy never survives.
fn copy_over(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    io::copy(&mut fs::File::open(src)?, staging.as_file_mut())?;
    staging.as_file().sync_all()?;
    staging.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Remove every empty directory below `root` (bottom-up). `root` itself stays.
pub fn remove_empty_dirs(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() && fs::read_dir(entry.path())?.next().is_none() {
            fs::remove_dir(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// All regular files below `root`, sorted, as `(normalized key, path)`.
pub fn list_files(root: &Path) -> Result<Vec<(String, PathBuf)>, FsError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| FsError::UnsafePath(entry.path().to_path_buf()))?;
        files.push((normalize_relative(rel)?, entry.into_path()));
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_lowercases_and_uses_slashes() {
        let key = normalize_relative(Path::new("Textures/Architecture/Wall_N.DDS")).unwrap();
        assert_eq!(key, "textures/architecture/wall_n.dds");
        assert_eq!(
            normalize_relative(Path::new("./textures/a.dds")).unwrap(),
            "textures/a.dds"
        );
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert!(normalize_relative(Path::new("../etc/passwd")).is_err());
        assert!(normalize_relative(Path::new("textures/../../x")).is_err());
        assert!(normalize_relative(Path::new("/abs/x.dds")).is_err());
        assert!(normalize_relative(Path::new("")).is_err());
    }

    #[test]
    fn safe_join_stays_inside() {
        let root = Path::new("/out");
        assert_eq!(
            safe_join(root, "textures/a.dds").unwrap(),
            PathBuf::from("/out/textures/a.dds")
        );
        assert!(safe_join(root, "../a.dds").is_err());
        assert!(safe_join(root, "/a.dds").is_err());
    }

    #[test]
    fn place_file_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.dds");
        let b = tmp.path().join("b.dds");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();
        let dest = tmp.path().join("out/textures/x.dds");

        place_file(&a, &dest, true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first");
        place_file(&b, &dest, false).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");
        // Replacing the link never touched the first source
        assert_eq!(fs::read(&a).unwrap(), b"first");
    }

    #[test]
    fn move_into_place_overwrites() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("scratch.dds");
        let dest = tmp.path().join("tree/a.dds");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"old").unwrap();
        fs::write(&src, b"new").unwrap();

        move_into_place(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(!src.exists());
    }

    #[test]
    fn copy_over_leaves_siblings_alone() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("scratch/a.dds");
        let dest = tmp.path().join("tree/a.dds");
        let sibling = tmp.path().join("tree/a.texsquash-partial");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();
        fs::write(&sibling, b"someone else's asset").unwrap();

        copy_over(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert_eq!(fs::read(&sibling).unwrap(), b"someone else's asset");
        let mut names: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.dds", "a.texsquash-partial"]);
    }

    #[test]
    fn copy_over_missing_source_leaves_dest() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("a.dds");
        fs::write(&dest, b"old").unwrap();

        assert!(copy_over(&tmp.path().join("gone.dds"), &dest).is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn remove_empty_dirs_bottom_up() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b/c")).unwrap();
        fs::create_dir_all(tmp.path().join("keep")).unwrap();
        fs::write(tmp.path().join("keep/f.dds"), b"x").unwrap();

        let removed = remove_empty_dirs(tmp.path()).unwrap();
        assert_eq!(removed, 3);
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("keep/f.dds").exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn list_files_sorted_keys() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("Textures/B")).unwrap();
        fs::write(tmp.path().join("Textures/B/z.dds"), b"z").unwrap();
        fs::write(tmp.path().join("Textures/a.dds"), b"a").unwrap();

        let keys: Vec<String> = list_files(tmp.path())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["textures/a.dds", "textures/b/z.dds"]);
    }
}
