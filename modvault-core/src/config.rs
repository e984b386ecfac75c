//! Configuration module for the on-disk layout
//!
//! Every directory the core touches comes from a [`LayoutConfig`]; nothing is
//! hard-coded. The default layout places everything under a single root.

use crate::error::IoResultExt;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default manifest file name expected at a package root
pub const DEFAULT_MANIFEST_NAME: &str = "modinfo.json";

/// Filesystem layout and behavior settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Live packages root (one subdirectory per installed package)
    pub packages_dir: PathBuf,
    /// Where uninstalled package directories and displaced files are moved
    pub package_trash_dir: PathBuf,
    /// Directory holding snapshot archives
    pub backups_dir: PathBuf,
    /// Where the live save directory is moved before a restore
    pub save_trash_dir: PathBuf,
    /// Live save-data directory
    pub save_dir: PathBuf,
    /// Installed soundpacks root
    pub soundpacks_dir: PathBuf,
    /// Registry database file
    pub database_path: PathBuf,
    /// Manifest file name required at a package root
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// Take a snapshot when the game exits
    #[serde(default)]
    pub backup_on_exit: bool,
}

fn default_manifest_name() -> String {
    DEFAULT_MANIFEST_NAME.to_string()
}

impl LayoutConfig {
    /// Create the default layout under `root`
    pub fn under_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        LayoutConfig {
            packages_dir: root.join("mods"),
            package_trash_dir: root.join("trash").join("mods"),
            backups_dir: root.join("backups"),
            save_trash_dir: root.join("trash").join("saves"),
            save_dir: root.join("save"),
            soundpacks_dir: root.join("sound"),
            database_path: root.join("registry.db"),
            manifest_name: default_manifest_name(),
            backup_on_exit: false,
        }
    }

    /// Load a layout from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).at_path(path)?;
        let config: LayoutConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (field, path) in [
            ("packages_dir", &self.packages_dir),
            ("package_trash_dir", &self.package_trash_dir),
            ("backups_dir", &self.backups_dir),
            ("save_trash_dir", &self.save_trash_dir),
            ("save_dir", &self.save_dir),
            ("soundpacks_dir", &self.soundpacks_dir),
            ("database_path", &self.database_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(VaultError::config(format!("{field} must not be empty")));
            }
        }

        let manifest = Path::new(&self.manifest_name);
        if self.manifest_name.trim().is_empty()
            || manifest.components().count() != 1
            || manifest.file_name().is_none()
        {
            return Err(VaultError::config(format!(
                "manifest_name must be a bare file name, got '{}'",
                self.manifest_name
            )));
        }

        if self.packages_dir == self.package_trash_dir || self.save_dir == self.save_trash_dir {
            return Err(VaultError::config(
                "trash directories must differ from the live directories they receive from",
            ));
        }

        Ok(())
    }

    /// Create every configured directory that does not exist yet
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.packages_dir,
            &self.package_trash_dir,
            &self.backups_dir,
            &self.save_trash_dir,
            &self.soundpacks_dir,
        ] {
            fs::create_dir_all(dir).at_path(dir)?;
        }
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).at_path(parent)?;
            }
        }
        Ok(())
    }
}
