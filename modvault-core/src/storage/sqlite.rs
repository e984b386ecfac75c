/*!
SQLite-backed registry store.
*/

use super::{
    from_micros, next_micros, schema, Disposable, Entity, RegistryQueries, Repository,
};
use crate::error::IoResultExt;
use crate::model::{FileRecord, NewFile, NewPackage, PackageRecord};
use crate::{Result, VaultError};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Anything that can lend out a registry connection
///
/// Both the store itself (autocommit) and an open [`StoreTransaction`]
/// implement this, so every [`Repository`] operation works in either mode.
pub trait Connected {
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>;
}

/// Registry store backed by a single SQLite connection
///
/// The connection sits behind a mutex; it is the only shared mutable resource
/// in the core, and every multi-row change goes through
/// [`SqliteStore::transaction`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).at_path(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        schema::init_db(&conn)?;
        info!(path = %path.display(), "Opened registry store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside one transaction
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. A
    /// failing commit is reported as an error after the closure has run, so
    /// callers that touched the filesystem inside `f` must undo on `Err`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTransaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = StoreTransaction {
            tx: conn.transaction()?,
        };

        let value = f(&tx)?;
        tx.tx
            .commit()
            .map_err(|e| VaultError::from_store(e, "commit registry transaction"))?;
        Ok(value)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::integrity("registry store lock poisoned"))
    }
}

impl Connected for SqliteStore {
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&*conn)
    }
}

/// An open registry transaction; dropped without commit means rolled back
pub struct StoreTransaction<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Connected for StoreTransaction<'_> {
    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&*self.tx)
    }
}

impl Disposable for SqliteStore {
    fn reset(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            BEGIN;
            DELETE FROM package_files;
            DELETE FROM packages;
            DELETE FROM sqlite_sequence WHERE name IN ('packages', 'package_files');
            COMMIT;
            ",
        )?;
        debug!("Registry store reset");
        Ok(())
    }

    fn destroy(self) -> Result<()> {
        let SqliteStore { conn, path } = self;
        let conn = conn
            .into_inner()
            .map_err(|_| VaultError::integrity("registry store lock poisoned"))?;
        conn.close().map_err(|(_, e)| VaultError::Database(e))?;

        if let Some(path) = path {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut candidate = path.clone().into_os_string();
                candidate.push(suffix);
                let candidate = PathBuf::from(candidate);
                if candidate.exists() {
                    fs::remove_file(&candidate).at_path(&candidate)?;
                }
            }
            debug!(path = %path.display(), "Registry store destroyed");
        }
        Ok(())
    }
}

impl<C, E> Repository<E> for C
where
    C: Connected,
    E: Entity,
{
    fn insert(&self, draft: E::Draft) -> Result<E> {
        self.with_conn(|conn| {
            let now = next_micros(None);
            let id = E::insert_row(conn, &draft, now)
                .map_err(|e| VaultError::from_store(e, &format!("insert {}", E::KIND)))?;
            select_by_id::<E>(conn, id)?.ok_or_else(|| {
                VaultError::integrity(format!("{} {id} vanished after insert", E::KIND))
            })
        })
    }

    fn find_by_id(&self, id: i64) -> Result<Option<E>> {
        self.with_conn(|conn| select_by_id::<E>(conn, id))
    }

    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM {} WHERE id IN ({placeholders}) ORDER BY id",
                E::COLUMNS,
                E::TABLE
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter()), |row| E::from_row(row))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn find_all(&self) -> Result<Vec<E>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM {} ORDER BY id", E::COLUMNS, E::TABLE);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| E::from_row(row))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn count_all(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", E::TABLE);
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    fn update(&self, entity: &E) -> Result<E> {
        self.with_conn(|conn| {
            let sql = format!("SELECT updated_at FROM {} WHERE id = ?1", E::TABLE);
            let previous: Option<i64> = conn
                .query_row(&sql, params![entity.id()], |row| row.get(0))
                .optional()?;
            let Some(previous) = previous else {
                return Err(VaultError::not_found(format!(
                    "{} with id {}",
                    E::KIND,
                    entity.id()
                )));
            };

            let now = next_micros(Some(previous));
            entity
                .update_row(conn, now)
                .map_err(|e| VaultError::from_store(e, &format!("update {}", E::KIND)))?;

            select_by_id::<E>(conn, entity.id())?.ok_or_else(|| {
                VaultError::integrity(format!("{} {} vanished after update", E::KIND, entity.id()))
            })
        })
    }

    fn delete(&self, entity: &E) -> Result<()> {
        self.with_conn(|conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", E::TABLE);
            let removed = conn
                .execute(&sql, params![entity.id()])
                .map_err(|e| VaultError::from_store(e, &format!("delete {}", E::KIND)))?;
            if removed == 0 {
                return Err(VaultError::not_found(format!(
                    "{} with id {}",
                    E::KIND,
                    entity.id()
                )));
            }
            Ok(())
        })
    }
}

impl<C: Connected> RegistryQueries for C {
    fn find_package_by_name(&self, name: &str) -> Result<Option<PackageRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE name = ?1",
                PackageRecord::COLUMNS,
                PackageRecord::TABLE
            );
            Ok(conn
                .query_row(&sql, params![name], |row| PackageRecord::from_row(row))
                .optional()?)
        })
    }

    fn find_files_for_package(&self, package_id: i64) -> Result<Vec<FileRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM {} WHERE package_id = ?1 ORDER BY path",
                FileRecord::COLUMNS,
                FileRecord::TABLE
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![package_id], |row| FileRecord::from_row(row))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn select_by_id<E: Entity>(conn: &Connection, id: i64) -> Result<Option<E>> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", E::COLUMNS, E::TABLE);
    Ok(conn
        .query_row(&sql, params![id], |row| E::from_row(row))
        .optional()?)
}

impl Entity for PackageRecord {
    type Draft = NewPackage;

    const KIND: &'static str = "package";
    const TABLE: &'static str = "packages";
    const COLUMNS: &'static str = "id, name, manifest, created_at, updated_at";

    fn id(&self) -> i64 {
        self.id
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(PackageRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            manifest: row.get(2)?,
            created_at: from_micros(row.get(3)?),
            updated_at: from_micros(row.get(4)?),
        })
    }

    fn insert_row(conn: &Connection, draft: &NewPackage, now: i64) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO packages (name, manifest, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![draft.name, draft.manifest, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_row(&self, conn: &Connection, now: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE packages SET name = ?1, manifest = ?2, updated_at = ?3 WHERE id = ?4",
            params![self.name, self.manifest, now, self.id],
        )
    }
}

impl Entity for FileRecord {
    type Draft = NewFile;

    const KIND: &'static str = "package file";
    const TABLE: &'static str = "package_files";
    const COLUMNS: &'static str = "id, package_id, path, hash, created_at, updated_at";

    fn id(&self) -> i64 {
        self.id
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(FileRecord {
            id: row.get(0)?,
            package_id: row.get(1)?,
            path: row.get(2)?,
            hash: row.get(3)?,
            created_at: from_micros(row.get(4)?),
            updated_at: from_micros(row.get(5)?),
        })
    }

    fn insert_row(conn: &Connection, draft: &NewFile, now: i64) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO package_files (package_id, path, hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![draft.package_id, draft.path, draft.hash, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_row(&self, conn: &Connection, now: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE package_files SET package_id = ?1, path = ?2, hash = ?3, updated_at = ?4
             WHERE id = ?5",
            params![self.package_id, self.path, self.hash, now, self.id],
        )
    }
}
