/*!
Save snapshots: timestamped zip archives of the live save directory.

Snapshots are not tracked in the registry; the backups directory is the
source of truth and every listing is a fresh scan. Backups are written under
a hidden partial name and renamed into place only once complete, so a listing
never shows a half-written archive.
*/

use crate::archive;
use crate::config::LayoutConfig;
use crate::error::IoResultExt;
use crate::fsops;
use crate::observability::{self, Operation};
use crate::progress::{BackgroundTask, ProgressSink, ProgressTracker};
use crate::{Result, VaultError};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// File extension of snapshot archives
pub const SNAPSHOT_EXTENSION: &str = "zip";

/// `chrono` format of generated snapshot names
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const PARTIAL_SUFFIX: &str = ".partial";

/// A snapshot archive found in the backups directory
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// File name, including the extension
    pub name: String,
    pub path: PathBuf,
    /// Archive size in bytes
    pub size: u64,
    /// Filesystem modification time, used as the creation time
    pub modified: DateTime<Utc>,
}

impl Snapshot {
    /// Read a snapshot's attributes from disk
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path).at_path(path)?;
        if !meta.is_file() {
            return Err(VaultError::not_found(format!(
                "snapshot {}",
                path.display()
            )));
        }
        let modified = meta.modified().at_path(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VaultError::validation(format!("bad snapshot name {}", path.display())))?
            .to_string();

        Ok(Snapshot {
            name,
            path: path.to_path_buf(),
            size: meta.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }

    /// Name without the archive extension
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.name)
    }
}

/// Creates, restores and organizes save snapshots
///
/// Cloning is cheap; clones share the lock that keeps a backup and a restore
/// from running at the same time.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    layout: LayoutConfig,
    busy: Arc<Mutex<()>>,
}

impl SnapshotManager {
    /// Create a manager; the backups and save trash directories are created
    pub fn new(layout: LayoutConfig) -> Result<Self> {
        layout.validate()?;
        for dir in [&layout.backups_dir, &layout.save_trash_dir] {
            fs::create_dir_all(dir).at_path(dir)?;
        }
        Ok(Self {
            layout,
            busy: Arc::new(Mutex::new(())),
        })
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    /// Snapshot the live save directory
    ///
    /// The returned task reports progress by bytes read and fails with
    /// `Validation` when there is nothing to back up.
    pub fn backup(&self, progress: Arc<dyn ProgressSink>) -> BackgroundTask<Snapshot> {
        let manager = self.clone();
        BackgroundTask::new("backup", progress, move |sink| {
            let result = manager.create_backup(sink);
            observability::record_operation(Operation::Backup, result.is_ok());
            match &result {
                Ok(snapshot) => {
                    info!(snapshot = %snapshot.name, bytes = snapshot.size, "Backup created")
                }
                Err(e) => error!(error = %e, "Backup failed"),
            }
            result
        })
    }

    /// Replace the live save directory with the contents of `snapshot`
    ///
    /// The current save directory is moved to the save trash first. If the
    /// extraction fails it is moved back; if that also fails it stays in the
    /// trash and the failure is logged.
    pub fn restore(
        &self,
        snapshot: &Snapshot,
        progress: Arc<dyn ProgressSink>,
    ) -> BackgroundTask<()> {
        let manager = self.clone();
        let snapshot = snapshot.clone();
        BackgroundTask::new("restore", progress, move |sink| {
            let result = manager.restore_snapshot(&snapshot, sink);
            observability::record_operation(Operation::Restore, result.is_ok());
            match &result {
                Ok(()) => info!(snapshot = %snapshot.name, "Backup restored"),
                Err(e) => error!(snapshot = %snapshot.name, error = %e, "Restore failed"),
            }
            result
        })
    }

    fn create_backup(&self, sink: Arc<dyn ProgressSink>) -> Result<Snapshot> {
        let _busy = self.lock()?;
        let save_dir = &self.layout.save_dir;
        if !self.save_files_exist() {
            return Err(VaultError::validation(format!(
                "no save files to back up in {}",
                save_dir.display()
            )));
        }

        let backups = &self.layout.backups_dir;
        fs::create_dir_all(backups).at_path(backups)?;
        let final_path = next_snapshot_path(backups, Local::now());
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("snapshot.zip");
        let partial = backups.join(format!(".{file_name}{PARTIAL_SUFFIX}"));

        let mut tracker = ProgressTracker::new(sink, fsops::directory_size(save_dir));
        tracker.start();

        let written = archive::write_archive(save_dir, &partial, |n| tracker.advance(n))
            .and_then(|bytes| fsops::move_path(&partial, &final_path).map(|_| bytes));
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                fsops::discard(&partial);
                return Err(e);
            }
        };
        observability::record_bytes(bytes);

        tracker.finish();
        Snapshot::from_path(&final_path)
    }

    fn restore_snapshot(&self, snapshot: &Snapshot, sink: Arc<dyn ProgressSink>) -> Result<()> {
        let _busy = self.lock()?;
        if !snapshot.path.is_file() {
            return Err(VaultError::not_found(format!("snapshot '{}'", snapshot.name)));
        }

        let total = archive::uncompressed_size(&snapshot.path)?;
        let mut tracker = ProgressTracker::new(sink, total);
        tracker.start();

        let save_dir = &self.layout.save_dir;
        let moved_aside = if save_dir.exists() {
            Some(fsops::move_to_trash(save_dir, &self.layout.save_trash_dir)?)
        } else {
            None
        };

        let extracted = fs::create_dir_all(save_dir)
            .at_path(save_dir)
            .and_then(|_| archive::extract_archive(&snapshot.path, save_dir, |n| tracker.advance(n)));

        match extracted {
            Ok(bytes) => {
                observability::record_bytes(bytes);
                if let Some(previous) = &moved_aside {
                    debug!(trashed = %previous.display(), "Previous save moved to trash");
                }
                tracker.finish();
                Ok(())
            }
            Err(e) => {
                fsops::discard(save_dir);
                if let Some(previous) = moved_aside {
                    if let Err(undo) = fsops::move_path(&previous, save_dir) {
                        error!(
                            trashed = %previous.display(),
                            error = %undo,
                            "Could not move previous save back, it remains in trash"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Rename a snapshot within the backups directory
    ///
    /// The new name is trimmed and gets the archive extension if missing.
    pub fn rename(&self, snapshot: &Snapshot, new_name: &str) -> Result<Snapshot> {
        let _busy = self.lock()?;
        let trimmed = new_name.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('.')
            || trimmed.contains(['/', '\\'])
            || trimmed.ends_with(PARTIAL_SUFFIX)
        {
            return Err(VaultError::validation(format!(
                "invalid snapshot name '{new_name}'"
            )));
        }

        let suffix = format!(".{SNAPSHOT_EXTENSION}");
        let file_name = if trimmed.to_ascii_lowercase().ends_with(&suffix) {
            trimmed.to_string()
        } else {
            format!("{trimmed}{suffix}")
        };

        if !snapshot.path.is_file() {
            return Err(VaultError::not_found(format!("snapshot '{}'", snapshot.name)));
        }
        let target = self.layout.backups_dir.join(&file_name);
        if target == snapshot.path {
            return Snapshot::from_path(&target);
        }
        if target.exists() {
            return Err(VaultError::validation(format!(
                "a snapshot named '{file_name}' already exists"
            )));
        }

        fsops::move_path(&snapshot.path, &target)?;
        info!(from = %snapshot.name, to = %file_name, "Backup renamed");
        Snapshot::from_path(&target)
    }

    /// Permanently delete a snapshot
    pub fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        let _busy = self.lock()?;
        match fs::remove_file(&snapshot.path) {
            Ok(()) => {
                info!(snapshot = %snapshot.name, "Backup deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VaultError::not_found(
                format!("snapshot '{}'", snapshot.name),
            )),
            Err(e) => Err(VaultError::io(&snapshot.path, e)),
        }
    }

    /// Every snapshot, newest first (ties broken by name, descending)
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let backups = &self.layout.backups_dir;
        let entries = match fs::read_dir(backups) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(backups, e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let path = entry.at_path(backups)?.path();
            if !is_snapshot_file(&path) {
                continue;
            }
            match Snapshot::from_path(&path) {
                Ok(snapshot) => snapshots.push(snapshot),
                // removed between the scan and the stat
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping snapshot"),
            }
        }

        snapshots.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(snapshots)
    }

    /// Most recent snapshot, if any
    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.list()?.into_iter().next())
    }

    /// True when the live save directory exists and is not empty
    pub fn save_files_exist(&self) -> bool {
        fsops::has_entries(&self.layout.save_dir)
    }

    /// The most recently modified world directory inside the save directory
    pub fn latest_save(&self) -> Result<Option<PathBuf>> {
        let save_dir = &self.layout.save_dir;
        let entries = match fs::read_dir(save_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::io(save_dir, e)),
        };

        let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry.at_path(save_dir)?;
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            if latest.as_ref().map_or(true, |(best, _)| modified > *best) {
                latest = Some((modified, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.busy
            .lock()
            .map_err(|_| VaultError::integrity("snapshot manager lock poisoned"))
    }
}

/// First free `backups/<timestamp>[_n].zip` path for `now`
fn next_snapshot_path(backups: &Path, now: DateTime<Local>) -> PathBuf {
    let base = now.format(SNAPSHOT_NAME_FORMAT).to_string();
    let candidate = backups.join(format!("{base}.{SNAPSHOT_EXTENSION}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let candidate = backups.join(format!("{base}_{counter}.{SNAPSHOT_EXTENSION}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(SNAPSHOT_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use chrono::TimeZone;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn manager(root: &Path) -> SnapshotManager {
        SnapshotManager::new(LayoutConfig::under_root(root)).unwrap()
    }

    fn fake_snapshot(manager: &SnapshotManager, name: &str, mtime: i64) -> Snapshot {
        let path = manager.layout().backups_dir.join(name);
        fs::write(&path, name).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        Snapshot::from_path(&path).unwrap()
    }

    #[test]
    fn test_snapshot_names_follow_timestamp_format() {
        let dir = TempDir::new().unwrap();
        let now = Local.with_ymd_and_hms(2024, 3, 9, 17, 5, 2).unwrap();

        let first = next_snapshot_path(dir.path(), now);
        assert_eq!(first, dir.path().join("2024-03-09_17-05-02.zip"));

        fs::write(&first, "x").unwrap();
        let second = next_snapshot_path(dir.path(), now);
        assert_eq!(second, dir.path().join("2024-03-09_17-05-02_1.zip"));
    }

    #[test]
    fn test_list_is_newest_first_and_skips_partials() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        fake_snapshot(&manager, "old.zip", 1_000);
        fake_snapshot(&manager, "new.zip", 3_000);
        fake_snapshot(&manager, "b-tie.zip", 2_000);
        fake_snapshot(&manager, "a-tie.zip", 2_000);
        fs::write(manager.layout().backups_dir.join(".x.zip.partial"), "p").unwrap();
        fs::write(manager.layout().backups_dir.join("notes.txt"), "n").unwrap();

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["new.zip", "b-tie.zip", "a-tie.zip", "old.zip"]);
        assert_eq!(manager.latest_snapshot().unwrap().unwrap().name, "new.zip");
    }

    #[test]
    fn test_backup_without_save_files_fails() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());

        let err = manager.backup(Arc::new(NoProgress)).run().unwrap_err();
        assert!(err.is_validation());
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_rename_rules() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let snapshot = fake_snapshot(&manager, "2024-01-01_00-00-00.zip", 1_000);
        let other = fake_snapshot(&manager, "taken.zip", 1_000);

        let renamed = manager.rename(&snapshot, "  before boss fight ").unwrap();
        assert_eq!(renamed.name, "before boss fight.zip");
        assert_eq!(renamed.stem(), "before boss fight");
        assert!(!snapshot.path.exists());

        for bad in ["", "   ", "a/b", "..\\x", ".hidden"] {
            assert!(manager.rename(&renamed, bad).unwrap_err().is_validation());
        }
        assert!(manager.rename(&renamed, "taken").unwrap_err().is_validation());
        assert!(other.path.exists());

        assert!(manager.rename(&snapshot, "ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_is_permanent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let snapshot = fake_snapshot(&manager, "gone.zip", 1_000);

        manager.delete(&snapshot).unwrap();
        assert!(!snapshot.path.exists());
        assert!(!fsops::has_entries(&manager.layout().save_trash_dir));
        assert!(manager.delete(&snapshot).unwrap_err().is_not_found());
    }

    #[test]
    fn test_failed_restore_puts_original_back() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let save = &manager.layout().save_dir;
        fs::create_dir_all(save.join("world")).unwrap();
        fs::write(save.join("world/master.gsav"), "original").unwrap();

        let evil = manager.layout().backups_dir.join("evil.zip");
        {
            use std::io::Write;
            use zip::write::SimpleFileOptions;
            let mut zip = zip::ZipWriter::new(fs::File::create(&evil).unwrap());
            zip.start_file("world/ok.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"fine").unwrap();
            zip.start_file("../escape.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"bad").unwrap();
            zip.finish().unwrap();
        }
        let snapshot = Snapshot::from_path(&evil).unwrap();

        let err = manager.restore(&snapshot, Arc::new(NoProgress)).run().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(
            fs::read_to_string(save.join("world/master.gsav")).unwrap(),
            "original"
        );
        assert!(!save.join("world/ok.txt").exists());
    }

    #[test]
    fn test_latest_save_picks_newest_world() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let save = &manager.layout().save_dir;
        assert!(manager.latest_save().unwrap().is_none());

        for (world, mtime) in [("Alpha", 1_000), ("Beta", 5_000), ("Gamma", 3_000)] {
            fs::create_dir_all(save.join(world)).unwrap();
            filetime::set_file_mtime(save.join(world), FileTime::from_unix_time(mtime, 0)).unwrap();
        }
        fs::write(save.join("stray.txt"), "x").unwrap();

        assert_eq!(manager.latest_save().unwrap(), Some(save.join("Beta")));
        assert!(manager.save_files_exist());
    }
}
