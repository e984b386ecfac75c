/*!
Soundpacks: untracked content directories copied into the soundpacks root.

Unlike packages, soundpacks have no registry rows and no per-file hashes.
Deleting one is permanent.
*/

use crate::config::LayoutConfig;
use crate::error::IoResultExt;
use crate::fsops;
use crate::observability::{self, Operation};
use crate::progress::{BackgroundTask, ProgressSink, ProgressTracker};
use crate::validator::package_name;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// An installed soundpack directory
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Soundpack {
    pub name: String,
    pub path: PathBuf,
    /// Total size of the directory in bytes
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl Soundpack {
    fn from_dir(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).at_path(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VaultError::validation(format!("bad soundpack name {}", path.display())))?
            .to_string();
        Ok(Soundpack {
            name,
            path: path.to_path_buf(),
            size: fsops::directory_size(path),
            modified: DateTime::<Utc>::from(meta.modified().at_path(path)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SoundpackManager {
    layout: LayoutConfig,
}

impl SoundpackManager {
    pub fn new(layout: LayoutConfig) -> Result<Self> {
        layout.validate()?;
        fs::create_dir_all(&layout.soundpacks_dir).at_path(&layout.soundpacks_dir)?;
        Ok(Self { layout })
    }

    /// Copy the soundpack directory `source` into the soundpacks root
    ///
    /// Fails with `Validation` if `source` is not a directory or a soundpack
    /// with the same name is already installed.
    pub fn install<P: AsRef<Path>>(
        &self,
        source: P,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Soundpack> {
        let source = source.as_ref();
        let result = self.install_inner(source, progress);
        observability::record_operation(Operation::SoundpackInstall, result.is_ok());
        match &result {
            Ok(pack) => info!(soundpack = %pack.name, bytes = pack.size, "Soundpack installed"),
            Err(e) => error!(source = %source.display(), error = %e, "Soundpack install failed"),
        }
        result
    }

    /// [`SoundpackManager::install`] packaged as a background task
    pub fn install_task(
        &self,
        source: PathBuf,
        progress: Arc<dyn ProgressSink>,
    ) -> BackgroundTask<Soundpack> {
        let manager = self.clone();
        BackgroundTask::new("soundpack", progress, move |sink| manager.install(source, sink))
    }

    fn install_inner(&self, source: &Path, progress: Arc<dyn ProgressSink>) -> Result<Soundpack> {
        if !source.is_dir() {
            return Err(VaultError::validation(format!(
                "soundpack source {} is not a directory",
                source.display()
            )));
        }
        let name = package_name(source)?;
        let root = &self.layout.soundpacks_dir;
        let target = root.join(&name);
        if target.exists() {
            return Err(VaultError::validation(format!(
                "soundpack '{name}' is already installed"
            )));
        }

        let mut tracker = ProgressTracker::new(progress, fsops::directory_size(source));
        tracker.start();

        let staging = root.join(format!(".staging-{}", Uuid::new_v4()));
        let copied = fsops::copy_tree(source, &staging, |bytes| tracker.advance(bytes))
            .and_then(|_| fsops::move_path(&staging, &target));
        if let Err(e) = copied {
            fsops::discard(&staging);
            return Err(e);
        }

        tracker.finish();
        Soundpack::from_dir(&target)
    }

    /// Installed soundpacks, newest first
    pub fn list(&self) -> Result<Vec<Soundpack>> {
        let root = &self.layout.soundpacks_dir;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::io(root, e)),
        };

        let mut packs = Vec::new();
        for entry in entries {
            let path = entry.at_path(root)?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if hidden || !path.is_dir() {
                continue;
            }
            packs.push(Soundpack::from_dir(&path)?);
        }

        packs.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(packs)
    }

    /// Permanently delete an installed soundpack
    pub fn delete(&self, soundpack: &Soundpack) -> Result<()> {
        if !soundpack.path.is_dir() {
            return Err(VaultError::not_found(format!("soundpack '{}'", soundpack.name)));
        }
        if soundpack.path.parent() != Some(self.layout.soundpacks_dir.as_path()) {
            return Err(VaultError::validation(format!(
                "{} is not inside the soundpacks directory",
                soundpack.path.display()
            )));
        }
        fs::remove_dir_all(&soundpack.path).at_path(&soundpack.path)?;
        info!(soundpack = %soundpack.name, "Soundpack deleted");
        Ok(())
    }
}
