/*!
Registry persistence.

This module defines the record-store abstraction (port) and its SQLite
implementation (adapter). The registry manager only talks to the traits
below, so it is independent of how rows are actually stored:

- [`Repository`] is the generic CRUD contract, one instance per record kind.
- [`RegistryQueries`] adds the two lookups the registry needs beyond CRUD.
- [`Disposable`] is a separate administrative capability used for test
  isolation; production flows never call it.
*/

pub mod schema;
pub mod sqlite;

#[cfg(test)]
mod sqlite_tests;

use crate::model::{FileRecord, PackageRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

pub use sqlite::{Connected, SqliteStore, StoreTransaction};

/// A record kind the store knows how to persist
///
/// `Draft` carries the caller-supplied fields of a record that has not been
/// inserted yet; the store assigns the id and both timestamps.
pub trait Entity: Sized + Clone {
    type Draft;

    /// Human-readable kind used in error messages
    const KIND: &'static str;
    const TABLE: &'static str;
    /// Column list matching [`Entity::from_row`]
    const COLUMNS: &'static str;

    fn id(&self) -> i64;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Insert `draft` with both timestamps set to `now`, returning the new id
    fn insert_row(conn: &Connection, draft: &Self::Draft, now: i64) -> rusqlite::Result<i64>;

    /// Write the mutable fields of `self` and set `updated_at` to `now`
    fn update_row(&self, conn: &Connection, now: i64) -> rusqlite::Result<usize>;
}

/// Generic CRUD contract for one record kind
pub trait Repository<E: Entity> {
    /// Insert a new record and return it with id and timestamps
    fn insert(&self, draft: E::Draft) -> Result<E>;

    fn find_by_id(&self, id: i64) -> Result<Option<E>>;

    /// Find every record whose id is in `ids`; unknown ids are skipped
    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<E>>;

    fn find_all(&self) -> Result<Vec<E>>;

    fn count_all(&self) -> Result<u64>;

    /// Persist the mutable fields of `entity`
    ///
    /// `created_at` is preserved and `updated_at` strictly increases. Fails
    /// with `NotFound` if no record has `entity.id()`.
    fn update(&self, entity: &E) -> Result<E>;

    /// Delete `entity`; package deletes cascade to their files
    fn delete(&self, entity: &E) -> Result<()>;
}

/// Lookups the registry manager needs beyond plain CRUD
pub trait RegistryQueries {
    fn find_package_by_name(&self, name: &str) -> Result<Option<PackageRecord>>;

    fn find_files_for_package(&self, package_id: i64) -> Result<Vec<FileRecord>>;
}

/// Administrative capability for throwaway stores
pub trait Disposable {
    /// Remove every row, keeping the schema
    fn reset(&self) -> Result<()>;

    /// Tear the store down entirely
    fn destroy(self) -> Result<()>;
}

/// Convert stored microseconds back into a timestamp
pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Current time in microseconds, strictly after `previous` when given
pub(crate) fn next_micros(previous: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_micros();
    match previous {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}
