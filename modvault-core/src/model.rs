/*!
Registry records and the package aggregate returned to callers.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered package row
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub id: i64,
    /// Declared name, unique across the registry
    pub name: String,
    /// Raw manifest text, stored verbatim
    pub manifest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a [`PackageRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPackage {
    pub name: String,
    pub manifest: String,
}

impl NewPackage {
    pub fn new<S1, S2>(name: S1, manifest: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            name: name.into(),
            manifest: manifest.into(),
        }
    }
}

/// One tracked file of a package
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub package_id: i64,
    /// Path relative to the package root, `/`-separated
    pub path: String,
    /// Hex content digest
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a [`FileRecord`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub package_id: i64,
    pub path: String,
    pub hash: String,
}

impl NewFile {
    pub fn new<S1, S2>(package_id: i64, path: S1, hash: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            package_id,
            path: path.into(),
            hash: hash.into(),
        }
    }
}

/// A package together with its resolved file list
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub manifest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
}

impl Package {
    pub fn from_parts(record: PackageRecord, mut files: Vec<FileRecord>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            id: record.id,
            name: record.name,
            manifest: record.manifest,
            created_at: record.created_at,
            updated_at: record.updated_at,
            files,
        }
    }

    /// The package row without its files
    pub fn record(&self) -> PackageRecord {
        PackageRecord {
            id: self.id,
            name: self.name.clone(),
            manifest: self.manifest.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }
}
