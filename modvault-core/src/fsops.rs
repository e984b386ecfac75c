/*!
Filesystem primitives shared by the managers.

Everything that relocates data goes through [`move_path`], which retries
transient failures and falls back to copy-then-remove when source and
destination sit on different devices. Trash relocation never overwrites: a
colliding name gets a timestamp suffix, then a counter.
*/

use crate::error::IoResultExt;
use crate::{Result, VaultError};
use chrono::Utc;
use modvault_retry::with_backoff;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A regular file found under a tree root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Path relative to the root, `/`-separated
    pub relative: String,
    pub absolute: PathBuf,
    pub size: u64,
}

/// Enumerate every regular file under `root`, sorted by relative path
///
/// Unreadable entries abort the walk; symlinks are not followed.
pub fn list_files<P: AsRef<Path>>(root: P) -> Result<Vec<TreeFile>> {
    let root = root.as_ref();
    let mut files = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map_err(|e| walk_error(root, e))?.len();
        files.push(TreeFile {
            relative: relative_path(root, entry.path())?,
            absolute: entry.into_path(),
            size,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// `/`-separated form of `path` relative to `root`
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        VaultError::validation(format!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(VaultError::validation(format!(
                        "non UTF-8 file name under {}",
                        root.display()
                    )))
                }
            },
            _ => {
                return Err(VaultError::validation(format!(
                    "unexpected path component in {}",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Resolve a stored `/`-separated relative path under `root`
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Total size in bytes of a file or directory tree
///
/// Informational: entries that cannot be read are skipped.
pub fn directory_size<P: AsRef<Path>>(path: P) -> u64 {
    WalkDir::new(path.as_ref())
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Copy one file, creating parent directories of `to` as needed
pub fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }
    let mut reader = File::open(from).at_path(from)?;
    let mut writer = File::create(to).at_path(to)?;
    io::copy(&mut reader, &mut writer).at_path(to)
}

/// Recursively copy `source` into `destination`
///
/// `destination` is created if missing; existing files are overwritten.
/// `on_file` is called with the size of every copied file. Returns the
/// number of files copied.
pub fn copy_tree<F>(source: &Path, destination: &Path, mut on_file: F) -> Result<u64>
where
    F: FnMut(u64),
{
    if !source.is_dir() {
        return Err(VaultError::validation(format!(
            "not a directory: {}",
            source.display()
        )));
    }
    fs::create_dir_all(destination).at_path(destination)?;

    let mut copied = 0u64;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(source, e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| VaultError::integrity("walk escaped its root"))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at_path(&target)?;
        } else if entry.file_type().is_file() {
            let bytes = copy_file(entry.path(), &target)?;
            on_file(bytes);
            copied += 1;
        }
    }
    Ok(copied)
}

/// Move a file or directory, retrying transient failures
///
/// Falls back to copy and remove when a plain rename cannot cross devices.
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }

    match with_backoff("rename", |_| fs::rename(from, to)) {
        Ok(()) => Ok(()),
        Err(err) => {
            let source = err.into_source();
            if !is_cross_device(&source) {
                return Err(VaultError::io(from, source));
            }
            debug!(from = %from.display(), to = %to.display(), "Cross-device move, copying");
            if from.is_dir() {
                copy_tree(from, to, |_| {})?;
                fs::remove_dir_all(from).at_path(from)?;
            } else {
                copy_file(from, to)?;
                fs::remove_file(from).at_path(from)?;
            }
            Ok(())
        }
    }
}

/// Pick a name under `dir` for `name` that does not exist yet
///
/// Collisions get a `.<timestamp>` suffix, then `-<n>`.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let plain = dir.join(name);
    if !plain.exists() {
        return plain;
    }

    let stamped = format!("{name}.{}", Utc::now().format("%Y%m%d-%H%M%S%.6f"));
    let candidate = dir.join(&stamped);
    if !candidate.exists() {
        return candidate;
    }

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stamped}-{counter}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Relocate `path` into `trash_root`, returning where it landed
pub fn move_to_trash(path: &Path, trash_root: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VaultError::validation(format!("cannot trash {}", path.display())))?;

    fs::create_dir_all(trash_root).at_path(trash_root)?;
    let destination = unique_destination(trash_root, name);
    move_path(path, &destination)?;

    debug!(from = %path.display(), to = %destination.display(), "Moved to trash");
    Ok(destination)
}

/// Remove a file or directory tree if it exists
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).at_path(path),
        Ok(_) => fs::remove_file(path).at_path(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::io(path, e)),
    }
}

/// Best-effort removal of a path during rollback; failures are only logged
pub fn discard(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!(path = %path.display(), error = %e, "Failed to clean up");
    }
}

/// Remove empty directories below `root` (and `root` itself when `include_root`)
pub fn prune_empty_dirs(root: &Path, include_root: bool) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // fails on non-empty directories, which is what we want
            let _ = fs::remove_dir(entry.path());
        }
    }
    if include_root {
        let _ = fs::remove_dir(root);
    }
}

/// True when `dir` exists and has at least one entry
pub fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// True when any regular file exists at any depth under `dir`
pub fn holds_files(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|entry| !entry.file_type().is_dir())
}

/// Create an empty file, creating its parent directories
pub fn touch(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at_path(parent)?;
    }
    File::create(path).at_path(path)
}

fn is_cross_device(err: &io::Error) -> bool {
    // EXDEV / ERROR_NOT_SAME_DEVICE
    if cfg!(windows) {
        err.raw_os_error() == Some(17)
    } else {
        err.raw_os_error() == Some(18)
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> VaultError {
    let path = err.path().unwrap_or(root).to_path_buf();
    match err.into_io_error() {
        Some(source) => VaultError::io(path, source),
        None => VaultError::integrity(format!("filesystem loop under {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_list_files_relative_and_sorted() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("b.json"), "b");
        write(&dir.path().join("items/z/m.json"), "mm");
        write(&dir.path().join("a.json"), "a");
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let files = list_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a.json", "b.json", "items/z/m.json"]);
        assert_eq!(files[2].size, 2);
        assert_eq!(resolve(dir.path(), &files[2].relative), files[2].absolute);
    }

    #[test]
    fn test_copy_file_onto_directory_names_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("in/x");
        let to = dir.path().join("live/x");
        write(&from, "file");
        fs::create_dir_all(&to).unwrap();

        match copy_file(&from, &to).unwrap_err() {
            VaultError::Io { path, .. } => assert_eq!(path, to),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = copy_file(&dir.path().join("in/missing"), &dir.path().join("live/y")).unwrap_err();
        match err {
            VaultError::Io { path, .. } => assert_eq!(path, dir.path().join("in/missing")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_holds_files_ignores_empty_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        assert!(!holds_files(dir.path()));

        write(&dir.path().join("a/b/f.json"), "{}");
        assert!(holds_files(dir.path()));
    }

    #[test]
    fn test_list_files_missing_root_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = list_files(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, VaultError::Io { .. }));
    }

    #[test]
    fn test_directory_size_sums_files_and_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("a"), "12345");
        write(&dir.path().join("sub/b"), "123");

        assert_eq!(directory_size(dir.path()), 8);
        assert_eq!(directory_size(dir.path().join("a")), 5);
        assert_eq!(directory_size(dir.path().join("missing")), 0);
    }

    #[test]
    fn test_copy_tree_reports_each_file() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(&src.path().join("a.txt"), "aaa");
        write(&src.path().join("nested/b.txt"), "bb");

        let mut seen = Vec::new();
        let copied = copy_tree(src.path(), &dst.path().join("out"), |bytes| seen.push(bytes)).unwrap();

        assert_eq!(copied, 2);
        seen.sort();
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(
            fs::read_to_string(dst.path().join("out/nested/b.txt")).unwrap(),
            "bb"
        );
    }

    #[test]
    fn test_move_to_trash_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let trash = dir.path().join("trash");

        let mut landed = Vec::new();
        for contents in ["one", "two", "three"] {
            let live = dir.path().join("demo");
            write(&live.join("a.json"), contents);
            landed.push(move_to_trash(&live, &trash).unwrap());
            assert!(!live.exists());
        }

        assert_eq!(landed[0], trash.join("demo"));
        assert_ne!(landed[1], landed[0]);
        assert_ne!(landed[2], landed[1]);
        for (path, contents) in landed.iter().zip(["one", "two", "three"]) {
            assert_eq!(fs::read_to_string(path.join("a.json")).unwrap(), contents);
        }
    }

    #[test]
    fn test_unique_destination_plain_when_free() {
        let dir = TempDir::new().unwrap();
        assert_eq!(unique_destination(dir.path(), "x"), dir.path().join("x"));
    }

    #[test]
    fn test_remove_path_and_prune() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("keep/file"), "x");
        fs::create_dir_all(dir.path().join("empty/deeper")).unwrap();

        prune_empty_dirs(dir.path(), false);
        assert!(!dir.path().join("empty").exists());
        assert!(dir.path().join("keep/file").exists());

        remove_path(&dir.path().join("keep")).unwrap();
        remove_path(&dir.path().join("keep")).unwrap();
        assert!(!dir.path().join("keep").exists());
        assert!(!has_entries(dir.path()));
    }

    #[test]
    fn test_relative_path_rejects_outside_root() {
        let err = relative_path(Path::new("/a/b"), Path::new("/c/d")).unwrap_err();
        assert!(err.is_validation());
    }
}
