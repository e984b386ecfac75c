/*!
Registry schema and migrations.

Schema versions are tracked in `PRAGMA user_version`. Timestamps are stored
as integer microseconds since the Unix epoch.
*/

use crate::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Latest schema version known to this build
pub const SCHEMA_VERSION: i64 = 1;

/// Apply connection pragmas and bring the schema up to [`SCHEMA_VERSION`]
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current < 1 {
        migrate_v1(conn)?;
    }
    if current > SCHEMA_VERSION {
        return Err(crate::VaultError::integrity(format!(
            "registry schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

/// Initial schema - Version 1
///
/// - packages: one row per installed package, keyed by unique name
/// - package_files: tracked files with content hashes, cascading with their package
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating registry schema version 1");

    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            manifest TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS package_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(package_id, path),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_package_files_package_id ON package_files(package_id);

        PRAGMA user_version = 1;

        COMMIT;
        ",
    )?;

    info!("Registry schema initialized at version 1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO package_files (package_id, path, hash, created_at, updated_at)
             VALUES (999, 'a.json', 'h', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        assert!(init_db(&conn).is_err());
    }
}
