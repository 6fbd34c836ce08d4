//! Small filesystem helpers shared by staging, merge and persistence.

use droidforge_core::{ExecError, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Reject absolute paths and any path containing `..`.
pub fn is_safe_relative(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Join `relative` onto `root` after checking it stays inside `root`.
///
/// # Errors
/// Returns `UnsafePath` when `relative` is absolute or walks up with `..`.
pub fn resolve_inside(root: &Path, relative: &Path) -> Result<PathBuf> {
    if !is_safe_relative(relative) {
        return Err(ExecError::UnsafePath(relative.to_path_buf()));
    }
    Ok(root.join(relative))
}

/// Write `contents` to `path` through a sibling temp file and a rename.
///
/// Readers see either the previous file or the complete new one.
///
/// # Errors
/// Returns an error if the parent directory cannot be created or the write or rename fails.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ExecError::UnsafePath(path.to_path_buf()))?;
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .ok_or_else(|| ExecError::UnsafePath(path.to_path_buf()))?
        .to_string_lossy();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&temp_path, contents).await?;
    if let Err(error) = fs::rename(&temp_path, path).await {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            tracing::debug!("Failed to remove temp file {}: {cleanup}", temp_path.display());
        }
        return Err(error.into());
    }
    Ok(())
}

/// Remove a directory tree, treating a missing directory as already removed.
///
/// # Errors
/// Returns an error for any failure other than "not found".
pub async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

/// Remove `path` if it is an empty directory. Returns whether it was removed.
///
/// # Errors
/// Returns an error if the directory cannot be listed or removed.
pub async fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error.into()),
    };
    if entries.next_entry().await?.is_some() {
        return Ok(false);
    }
    fs::remove_dir(path).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_safe_relative() {
        assert!(is_safe_relative(Path::new("src/lib.rs")));
        assert!(is_safe_relative(Path::new("./README.md")));
        assert!(!is_safe_relative(Path::new("../outside.txt")));
        assert!(!is_safe_relative(Path::new("src/../../etc/passwd")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_resolve_inside_rejects_escape() {
        let result = resolve_inside(Path::new("/repo"), Path::new("../x"));
        assert!(matches!(result, Err(ExecError::UnsafePath(_))));
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_replaces() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let target = tmp_dir.path().join("a").join("b").join("file.txt");

        if let Err(error) = write_atomic(&target, b"first").await {
            panic!("first write failed: {error}");
        }
        if let Err(error) = write_atomic(&target, b"second").await {
            panic!("second write failed: {error}");
        }

        let contents = match fs::read_to_string(&target).await {
            Ok(contents) => contents,
            Err(error) => panic!("read failed: {error}"),
        };
        assert_eq!(contents, "second");

        let mut entries = match fs::read_dir(tmp_dir.path().join("a").join("b")).await {
            Ok(entries) => entries,
            Err(error) => panic!("read_dir failed: {error}"),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name());
        }
        assert_eq!(names.len(), 1, "temp file left behind: {names:?}");
    }

    #[tokio::test]
    async fn test_remove_dir_helpers() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let missing = tmp_dir.path().join("missing");
        assert!(matches!(remove_dir_if_exists(&missing).await, Ok(false)));
        assert!(matches!(remove_dir_if_empty(&missing).await, Ok(false)));

        let empty = tmp_dir.path().join("empty");
        if let Err(error) = fs::create_dir(&empty).await {
            panic!("mkdir failed: {error}");
        }
        assert!(matches!(remove_dir_if_empty(&empty).await, Ok(true)));
        assert!(!empty.exists());
    }
}
