/*!
Package validation.

A package source is either a `.zip` archive or a directory. Validation turns
it into a [`WorkingTree`]: a directory whose root holds the manifest file,
together with the declared package name and the manifest text.
*/

use crate::archive;
use crate::error::IoResultExt;
use crate::{Result, VaultError};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// A validated package tree ready to be hashed and copied
///
/// When the source was an archive, the extraction lives in a temporary
/// directory owned by this value and is removed when it is dropped.
#[derive(Debug)]
pub struct WorkingTree {
    root: PathBuf,
    name: String,
    manifest: String,
    _temp: Option<TempDir>,
}

impl WorkingTree {
    /// Directory holding the manifest
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declared package name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manifest text, verbatim
    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    /// True when the tree was extracted from an archive
    pub fn is_extracted(&self) -> bool {
        self._temp.is_some()
    }
}

/// Validates package sources against a manifest file name
#[derive(Debug, Clone)]
pub struct PackageValidator {
    manifest_name: String,
}

impl PackageValidator {
    pub fn new(manifest_name: impl Into<String>) -> Self {
        Self {
            manifest_name: manifest_name.into(),
        }
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest_name
    }

    /// Validate `source` and normalize it into a [`WorkingTree`]
    ///
    /// # Arguments
    /// * `source` - A `.zip` archive or a package directory
    ///
    /// # Returns
    /// The working tree, or `Validation` if the source is neither form or
    /// has no manifest at its root
    pub fn validate<P: AsRef<Path>>(&self, source: P) -> Result<WorkingTree> {
        let source = source.as_ref();
        let name = package_name(source)?;

        let (base, temp) = if source.is_dir() {
            (source.to_path_buf(), None)
        } else if source.is_file() && is_zip(source) {
            let temp = tempfile::Builder::new()
                .prefix("modvault-pkg-")
                .tempdir()
                .at_path(std::env::temp_dir())?;
            archive::extract_archive(source, temp.path(), |_| {})?;
            (temp.path().to_path_buf(), Some(temp))
        } else if !source.exists() {
            return Err(VaultError::validation(format!(
                "package source {} does not exist",
                source.display()
            )));
        } else {
            return Err(VaultError::validation(format!(
                "package source {} is neither a .zip archive nor a directory",
                source.display()
            )));
        };

        let root = self.locate_root(&base).ok_or_else(|| {
            VaultError::validation(format!(
                "missing manifest '{}' in {}",
                self.manifest_name,
                source.display()
            ))
        })?;

        let manifest_path = root.join(&self.manifest_name);
        let bytes = fs::read(&manifest_path).at_path(&manifest_path)?;
        let manifest = String::from_utf8(bytes).map_err(|_| {
            VaultError::validation(format!("manifest {} is not UTF-8", manifest_path.display()))
        })?;

        debug!(
            source = %source.display(),
            package = %name,
            root = %root.display(),
            "Package source validated"
        );

        Ok(WorkingTree {
            root,
            name,
            manifest,
            _temp: temp,
        })
    }

    /// The manifest must sit at `base`, or at the root of the only entry of
    /// `base` when that entry is a directory
    fn locate_root(&self, base: &Path) -> Option<PathBuf> {
        if base.join(&self.manifest_name).is_file() {
            return Some(base.to_path_buf());
        }

        let mut entries = fs::read_dir(base).ok()?.filter_map(|e| e.ok());
        let only = entries.next()?;
        if entries.next().is_some() {
            return None;
        }

        let candidate = only.path();
        if candidate.is_dir() && candidate.join(&self.manifest_name).is_file() {
            Some(candidate)
        } else {
            None
        }
    }
}

/// Package name declared by a source path: its file stem
pub fn package_name(source: &Path) -> Result<String> {
    let stem = if source.is_dir() {
        source.file_name()
    } else {
        source.file_stem()
    };

    let name = stem
        .and_then(|s| s.to_str())
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(VaultError::validation(format!(
            "cannot derive a package name from {}",
            source.display()
        )));
    }
    Ok(name.to_string())
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn zip_with(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn validator() -> PackageValidator {
        PackageValidator::new("modinfo.json")
    }

    #[test]
    fn test_validate_flat_zip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("mutation_rebalance.zip");
        zip_with(
            &source,
            &[
                ("modinfo.json", "{\"id\":\"mr\"}"),
                ("README.md", "readme"),
                ("items/armor/integrated.json", "[]"),
            ],
        );

        let tree = validator().validate(&source).unwrap();
        assert_eq!(tree.name(), "mutation_rebalance");
        assert_eq!(tree.manifest(), "{\"id\":\"mr\"}");
        assert!(tree.is_extracted());
        assert!(tree.root().join("items/armor/integrated.json").is_file());

        let extracted = tree.root().to_path_buf();
        drop(tree);
        assert!(!extracted.exists());
    }

    #[test]
    fn test_validate_zip_with_single_top_directory() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("wrapped.zip");
        zip_with(
            &source,
            &[
                ("wrapped/modinfo.json", "{}"),
                ("wrapped/data/a.json", "a"),
            ],
        );

        let tree = validator().validate(&source).unwrap();
        assert!(tree.root().ends_with("wrapped"));
        assert!(tree.root().join("data/a.json").is_file());
    }

    #[test]
    fn test_validate_directory_in_place() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("demo");
        fs::create_dir_all(source.join("items")).unwrap();
        fs::write(source.join("modinfo.json"), "{\"name\":\"demo\"}").unwrap();
        fs::write(source.join("items/a.json"), "a").unwrap();

        let tree = validator().validate(&source).unwrap();
        assert_eq!(tree.name(), "demo");
        assert_eq!(tree.root(), source.as_path());
        assert!(!tree.is_extracted());

        drop(tree);
        assert!(source.join("modinfo.json").exists());
    }

    #[test]
    fn test_missing_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.zip");
        zip_with(&source, &[("README.md", "x"), ("deep/nested/modinfo.json", "{}")]);

        let err = validator().validate(&source).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("missing manifest"));
    }

    #[test]
    fn test_rejects_other_file_types_and_missing_sources() {
        let dir = TempDir::new().unwrap();
        let text = dir.path().join("notes.txt");
        fs::write(&text, "hi").unwrap();

        assert!(validator().validate(&text).unwrap_err().is_validation());
        assert!(validator()
            .validate(dir.path().join("ghost.zip"))
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_package_name_from_stem() {
        assert_eq!(package_name(Path::new("/tmp/foo.zip")).unwrap(), "foo");
        assert!(package_name(Path::new("/tmp/.zip")).is_err());
    }
}
