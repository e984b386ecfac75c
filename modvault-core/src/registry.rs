/*!
Registry manager: install, reinstall and uninstall of content packages.

The manager keeps the registry store and the live packages directory in step:

- A fresh install copies the package into a hidden staging directory, writes
  the package and file rows in one transaction, and renames the staging
  directory into place before committing.
- A reinstall diffs the incoming `(path, hash)` pairs against the stored rows
  and only touches files that were added, changed or removed. Old versions of
  changed and removed files are parked in the package trash.
- An uninstall moves the live directory into the package trash and then
  deletes the rows (files cascade).

Any failure rolls the store back and undoes the filesystem work done so far.
Operations on the same package name are serialized.
*/

use crate::config::LayoutConfig;
use crate::fsops::{self, TreeFile};
use crate::hash::hash_file;
use crate::model::{FileRecord, NewFile, NewPackage, Package, PackageRecord};
use crate::observability::{self, Operation};
use crate::progress::{BackgroundTask, ProgressSink, ProgressTracker};
use crate::storage::{RegistryQueries, Repository, SqliteStore};
use crate::validator::{PackageValidator, WorkingTree};
use crate::{Result, VaultError};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback that ignores the trashed location
pub const DO_NOTHING: fn(&Path) = ignore_trashed;

fn ignore_trashed(_: &Path) {}

/// A file of an incoming package tree with its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub relative: String,
    pub absolute: PathBuf,
    pub size: u64,
    pub hash: String,
}

/// A stored row paired with the incoming file at the same path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub record: FileRecord,
    pub incoming: HashedFile,
}

/// Difference between an incoming tree and the stored rows of a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub added: Vec<HashedFile>,
    pub changed: Vec<FileChange>,
    pub removed: Vec<FileRecord>,
    pub unchanged: Vec<FileChange>,
}

impl FileDiff {
    /// True when no row needs to be written
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Classify incoming files against stored rows, keyed by relative path
pub fn diff_files(incoming: &[HashedFile], existing: &[FileRecord]) -> FileDiff {
    let mut stored: BTreeMap<&str, &FileRecord> =
        existing.iter().map(|r| (r.path.as_str(), r)).collect();
    let mut diff = FileDiff::default();

    for file in incoming {
        match stored.remove(file.relative.as_str()) {
            None => diff.added.push(file.clone()),
            Some(record) => {
                let change = FileChange {
                    record: record.clone(),
                    incoming: file.clone(),
                };
                if record.hash == file.hash {
                    diff.unchanged.push(change);
                } else {
                    diff.changed.push(change);
                }
            }
        }
    }

    diff.removed = stored.into_values().cloned().collect();
    diff
}

/// Result of [`RegistryManager::uninstall`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub package: String,
    /// Where the live directory was moved; `None` if it was already gone
    pub trashed: Option<PathBuf>,
}

/// Filesystem step recorded during a reinstall so it can be undone
enum Undo {
    Written(PathBuf),
    Displaced { live: PathBuf, parked: PathBuf },
    Pruned(PathBuf),
}

/// Owns the package lifecycle against one store and one layout
pub struct RegistryManager {
    store: Arc<SqliteStore>,
    layout: LayoutConfig,
    validator: PackageValidator,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RegistryManager {
    /// Create a manager; the layout is validated and its package directories created
    pub fn new(store: Arc<SqliteStore>, layout: LayoutConfig) -> Result<Self> {
        layout.validate()?;
        for dir in [&layout.packages_dir, &layout.package_trash_dir] {
            std::fs::create_dir_all(dir).map_err(|e| VaultError::io(dir, e))?;
        }

        Ok(Self {
            validator: PackageValidator::new(layout.manifest_name.clone()),
            store,
            layout,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Validate a package source without installing it
    pub fn validate<P: AsRef<Path>>(&self, source: P) -> Result<WorkingTree> {
        self.validator.validate(source)
    }

    /// Install or reinstall the package at `source`
    ///
    /// # Arguments
    /// * `source` - A `.zip` archive or a package directory
    /// * `progress` - Receives 0..=100; 100 is reported once, on success
    ///
    /// # Returns
    /// The persisted package with its file list
    pub fn install<P: AsRef<Path>>(
        &self,
        source: P,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Package> {
        let source = source.as_ref();
        let result = self.install_inner(source, progress);
        observability::record_operation(Operation::Install, result.is_ok());
        match &result {
            Ok(package) => info!(
                package = %package.name,
                files = package.files.len(),
                "Package installed"
            ),
            Err(e) => error!(source = %source.display(), error = %e, "Package install failed"),
        }
        result
    }

    /// [`RegistryManager::install`] packaged as a background task
    pub fn install_task(
        self: &Arc<Self>,
        source: PathBuf,
        progress: Arc<dyn ProgressSink>,
    ) -> BackgroundTask<Package> {
        let manager = Arc::clone(self);
        BackgroundTask::new("install", progress, move |sink| manager.install(source, sink))
    }

    fn install_inner(&self, source: &Path, progress: Arc<dyn ProgressSink>) -> Result<Package> {
        let tree = self.validator.validate(source)?;
        let files = fsops::list_files(tree.root())?;

        // hashing and copying each count one unit per file
        let tracker = Mutex::new(ProgressTracker::new(progress, files.len() as u64 * 2));
        lock_tracker(&tracker).start();
        let hashed = hash_all(&files, &tracker)?;
        let mut tracker = tracker
            .into_inner()
            .map_err(|_| VaultError::integrity("progress tracker lock poisoned"))?;

        let lock = self.name_lock(tree.name())?;
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let package = match self.store.find_package_by_name(tree.name())? {
            None => self.install_new(&tree, &hashed, &mut tracker)?,
            Some(record) => self.reinstall(record, &tree, &hashed, &mut tracker)?,
        };

        tracker.finish();
        Ok(package)
    }

    fn install_new(
        &self,
        tree: &WorkingTree,
        hashed: &[HashedFile],
        tracker: &mut ProgressTracker,
    ) -> Result<Package> {
        let live = self.layout.packages_dir.join(tree.name());
        if live.exists() {
            warn!(
                package = tree.name(),
                path = %live.display(),
                "Unregistered package directory found, moving it to trash"
            );
            fsops::move_to_trash(&live, &self.layout.package_trash_dir)?;
        }

        let staging = self
            .layout
            .packages_dir
            .join(format!(".staging-{}", Uuid::new_v4()));
        let mut moved_into_place = false;

        let result =
            self.stage_and_commit(tree, hashed, &staging, &live, tracker, &mut moved_into_place);
        if result.is_err() {
            fsops::discard(&staging);
            if moved_into_place {
                fsops::discard(&live);
            }
        }
        result
    }

    fn stage_and_commit(
        &self,
        tree: &WorkingTree,
        hashed: &[HashedFile],
        staging: &Path,
        live: &Path,
        tracker: &mut ProgressTracker,
        moved_into_place: &mut bool,
    ) -> Result<Package> {
        std::fs::create_dir_all(staging).map_err(|e| VaultError::io(staging, e))?;
        for file in hashed {
            fsops::copy_file(&file.absolute, &fsops::resolve(staging, &file.relative))?;
            tracker.advance(1);
        }

        self.store.transaction(|tx| {
            let record: PackageRecord = tx.insert(NewPackage::new(tree.name(), tree.manifest()))?;
            let mut rows = Vec::with_capacity(hashed.len());
            for file in hashed {
                let row: FileRecord =
                    tx.insert(NewFile::new(record.id, &file.relative, &file.hash))?;
                rows.push(row);
            }

            fsops::move_path(staging, live)?;
            *moved_into_place = true;
            Ok(Package::from_parts(record, rows))
        })
    }

    fn reinstall(
        &self,
        mut record: PackageRecord,
        tree: &WorkingTree,
        hashed: &[HashedFile],
        tracker: &mut ProgressTracker,
    ) -> Result<Package> {
        let live = self.layout.packages_dir.join(&record.name);
        let rows = self.store.find_files_for_package(record.id)?;
        let mut diff = diff_files(hashed, &rows);

        // rows that match but whose live file went missing are rewritten on disk only
        let (present, missing): (Vec<_>, Vec<_>) = diff
            .unchanged
            .drain(..)
            .partition(|c| fsops::resolve(&live, &c.record.path).is_file());
        diff.unchanged = present;
        let repairs: Vec<HashedFile> = missing.into_iter().map(|c| c.incoming).collect();

        let copies = diff.added.len() + diff.changed.len() + repairs.len();
        tracker.advance((hashed.len() - copies) as u64);

        let manifest_changed = record.manifest != tree.manifest();
        if diff.is_empty() && repairs.is_empty() && !manifest_changed {
            debug!(package = %record.name, "Reinstall found no changes");
            let files = diff.unchanged.into_iter().map(|c| c.record).collect();
            return Ok(Package::from_parts(record, files));
        }

        debug!(
            package = %record.name,
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            repaired = repairs.len(),
            "Applying package changes"
        );

        let displaced = fsops::unique_destination(
            &self.layout.package_trash_dir,
            &format!("{}.displaced-{}", record.name, Utc::now().format("%Y%m%d-%H%M%S")),
        );
        let mut journal: Vec<Undo> = Vec::new();

        let result = self.store.transaction(|tx| {
            for change in &diff.changed {
                let mut row = change.record.clone();
                row.hash = change.incoming.hash.clone();
                let _: FileRecord = tx.update(&row)?;
            }
            for file in &diff.added {
                let _: FileRecord = tx.insert(NewFile::new(record.id, &file.relative, &file.hash))?;
            }
            for row in &diff.removed {
                tx.delete(row)?;
            }
            if !diff.is_empty() || manifest_changed {
                record.manifest = tree.manifest().to_string();
                record = tx.update(&record)?;
            }

            // untracked files sitting where an added file goes are parked too
            let outgoing = diff
                .changed
                .iter()
                .map(|c| &c.record.path)
                .chain(diff.removed.iter().map(|r| &r.path))
                .chain(diff.added.iter().map(|f| &f.relative));
            for path in outgoing {
                let current = fsops::resolve(&live, path);
                if current.is_file() {
                    let parked = fsops::resolve(&displaced, path);
                    fsops::move_path(&current, &parked)?;
                    journal.push(Undo::Displaced {
                        live: current,
                        parked,
                    });
                }
            }

            let incoming: Vec<&HashedFile> = diff
                .added
                .iter()
                .chain(diff.changed.iter().map(|c| &c.incoming))
                .chain(repairs.iter())
                .collect();

            // a directory emptied above may sit where a file now goes
            for file in &incoming {
                let target = fsops::resolve(&live, &file.relative);
                if target.is_dir() && !fsops::holds_files(&target) {
                    fsops::remove_path(&target)?;
                    journal.push(Undo::Pruned(target));
                }
            }

            for file in incoming {
                let target = fsops::resolve(&live, &file.relative);
                if let Err(e) = fsops::copy_file(&file.absolute, &target) {
                    if target.is_file() {
                        fsops::discard(&target);
                    }
                    return Err(e);
                }
                journal.push(Undo::Written(target));
                tracker.advance(1);
            }
            Ok(())
        });

        if let Err(e) = result {
            rollback(journal);
            fsops::prune_empty_dirs(&displaced, true);
            return Err(e);
        }

        fsops::prune_empty_dirs(&displaced, true);
        if !diff.removed.is_empty() {
            fsops::prune_empty_dirs(&live, false);
        }

        let files = self.store.find_files_for_package(record.id)?;
        Ok(Package::from_parts(record, files))
    }

    /// Remove a package, moving its live directory into the package trash
    ///
    /// `on_trashed` is called with the trash location only when a directory
    /// was actually moved.
    pub fn uninstall<F>(&self, package: &Package, on_trashed: F) -> Result<UninstallOutcome>
    where
        F: FnOnce(&Path),
    {
        let result = self.uninstall_inner(package, on_trashed);
        observability::record_operation(Operation::Uninstall, result.is_ok());
        if let Err(e) = &result {
            error!(package = %package.name, error = %e, "Package uninstall failed");
        }
        result
    }

    fn uninstall_inner<F>(&self, package: &Package, on_trashed: F) -> Result<UninstallOutcome>
    where
        F: FnOnce(&Path),
    {
        let lock = self.name_lock(&package.name)?;
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let record: PackageRecord = self
            .store
            .find_by_id(package.id)?
            .ok_or_else(|| VaultError::not_found(format!("package '{}'", package.name)))?;

        let live = self.package_path(package);
        let trashed = if live.exists() {
            Some(fsops::move_to_trash(&live, &self.layout.package_trash_dir)?)
        } else {
            warn!(
                package = %package.name,
                path = %live.display(),
                "Package directory already missing, removing registry rows only"
            );
            None
        };

        if let Err(e) = self.store.transaction(|tx| tx.delete(&record)) {
            if let Some(parked) = &trashed {
                if let Err(restore) = fsops::move_path(parked, &live) {
                    error!(
                        package = %package.name,
                        trashed = %parked.display(),
                        error = %restore,
                        "Could not move package back after failed uninstall"
                    );
                }
            }
            return Err(e);
        }

        if let Some(parked) = &trashed {
            on_trashed(parked);
        }
        info!(package = %package.name, "Package uninstalled");

        Ok(UninstallOutcome {
            package: package.name.clone(),
            trashed,
        })
    }

    /// Every registered package with its files, sorted by name
    pub fn list_packages(&self) -> Result<Vec<Package>> {
        let records: Vec<PackageRecord> = self.store.find_all()?;
        let mut packages = records
            .into_iter()
            .map(|record| {
                let files = self.store.find_files_for_package(record.id)?;
                Ok(Package::from_parts(record, files))
            })
            .collect::<Result<Vec<_>>>()?;
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    pub fn find_package_by_name(&self, name: &str) -> Result<Option<Package>> {
        match self.store.find_package_by_name(name)? {
            Some(record) => {
                let files = self.store.find_files_for_package(record.id)?;
                Ok(Some(Package::from_parts(record, files)))
            }
            None => Ok(None),
        }
    }

    /// Live directory of a package
    pub fn package_path(&self, package: &Package) -> PathBuf {
        self.layout.packages_dir.join(&package.name)
    }

    /// The package whose live directory contains `path`
    pub fn package_for_path<P: AsRef<Path>>(&self, path: P) -> Result<Option<Package>> {
        let path = path.as_ref();
        let root = &self.layout.packages_dir;
        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => {
                let canonical_root = root.canonicalize().map_err(|e| VaultError::io(root, e))?;
                match path.canonicalize().ok().and_then(|p| {
                    p.strip_prefix(&canonical_root).ok().map(Path::to_path_buf)
                }) {
                    Some(relative) => relative,
                    None => return Ok(None),
                }
            }
        };

        match relative.components().next() {
            Some(Component::Normal(name)) => match name.to_str() {
                Some(name) => self.find_package_by_name(name),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Size on disk of a package's live directory
    pub fn package_size(&self, package: &Package) -> u64 {
        fsops::directory_size(self.package_path(package))
    }

    fn name_lock(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| VaultError::integrity("package lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(name.to_string()).or_default()))
    }
}

fn hash_all(files: &[TreeFile], tracker: &Mutex<ProgressTracker>) -> Result<Vec<HashedFile>> {
    files
        .par_iter()
        .map(|file| -> Result<HashedFile> {
            let hash = hash_file(&file.absolute)?;
            lock_tracker(tracker).advance(1);
            Ok(HashedFile {
                relative: file.relative.clone(),
                absolute: file.absolute.clone(),
                size: file.size,
                hash,
            })
        })
        .collect()
}

fn lock_tracker(tracker: &Mutex<ProgressTracker>) -> std::sync::MutexGuard<'_, ProgressTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rollback(journal: Vec<Undo>) {
    for step in journal.into_iter().rev() {
        match step {
            Undo::Written(path) => fsops::discard(&path),
            Undo::Pruned(dir) => {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "Could not recreate directory");
                }
            }
            Undo::Displaced { live, parked } => {
                if let Err(e) = fsops::move_path(&parked, &live) {
                    error!(
                        live = %live.display(),
                        parked = %parked.display(),
                        error = %e,
                        "Could not restore displaced file"
                    );
                }
            }
        }
    }
}
