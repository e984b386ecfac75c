/*!
Unit tests for the SQLite registry store.
*/

#[cfg(test)]
mod tests {
    use crate::model::{FileRecord, NewFile, NewPackage, PackageRecord};
    use crate::storage::{Disposable, RegistryQueries, Repository, SqliteStore};
    use crate::VaultError;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn demo_package(store: &SqliteStore) -> PackageRecord {
        store.insert(NewPackage::new("demo", "{\"name\":\"demo\"}")).unwrap()
    }

    #[test]
    fn test_insert_sets_identical_timestamps() {
        let store = store();
        let package = demo_package(&store);

        assert!(package.id > 0);
        assert_eq!(package.name, "demo");
        assert_eq!(package.created_at, package.updated_at);

        let file: FileRecord = store.insert(NewFile::new(package.id, "a.json", "h1")).unwrap();
        assert_eq!(file.package_id, package.id);
        assert_eq!(file.created_at, file.updated_at);
    }

    #[test]
    fn test_find_by_id() {
        let store = store();
        let package = demo_package(&store);

        let found: Option<PackageRecord> = store.find_by_id(package.id).unwrap();
        assert_eq!(found, Some(package));

        let missing: Option<PackageRecord> = store.find_by_id(9_999).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_find_by_ids_skips_unknown_ids() {
        let store = store();
        let package = demo_package(&store);
        let a: FileRecord = store.insert(NewFile::new(package.id, "a.json", "h1")).unwrap();
        let b: FileRecord = store.insert(NewFile::new(package.id, "b.json", "h2")).unwrap();

        let found: Vec<FileRecord> = store.find_by_ids(&[b.id, 4_242, a.id, -1]).unwrap();
        let ids: Vec<i64> = found.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let none: Vec<FileRecord> = store.find_by_ids(&[]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_find_all_and_count_all() {
        let store = store();
        let first = demo_package(&store);
        let second: PackageRecord = store.insert(NewPackage::new("other", "{}")).unwrap();

        let all: Vec<PackageRecord> = store.find_all().unwrap();
        assert_eq!(all, vec![first, second]);
        assert_eq!(Repository::<PackageRecord>::count_all(&store).unwrap(), 2);
        assert_eq!(Repository::<FileRecord>::count_all(&store).unwrap(), 0);
    }

    #[test]
    fn test_update_keeps_created_and_advances_updated() {
        let store = store();
        let package = demo_package(&store);
        let file: FileRecord = store.insert(NewFile::new(package.id, "a", "h1")).unwrap();

        let mut changed = file.clone();
        changed.path = "b".to_string();
        let updated = store.update(&changed).unwrap();

        assert_eq!(updated.id, file.id);
        assert_eq!(updated.path, "b");
        assert_eq!(updated.created_at, file.created_at);
        assert!(updated.updated_at > file.updated_at);

        let again = store.update(&updated).unwrap();
        assert!(again.updated_at > updated.updated_at);
    }

    #[test]
    fn test_update_missing_record_is_not_found() {
        let store = store();
        let mut package = demo_package(&store);
        package.id = 77;

        let err = store.update(&package).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_package_cascades_to_files() {
        let store = store();
        let package = demo_package(&store);
        let _: FileRecord = store.insert(NewFile::new(package.id, "a.json", "h1")).unwrap();
        let _: FileRecord = store.insert(NewFile::new(package.id, "b.json", "h2")).unwrap();

        store.delete(&package).unwrap();

        assert!(store.find_package_by_name("demo").unwrap().is_none());
        assert!(store.find_files_for_package(package.id).unwrap().is_empty());
        assert_eq!(Repository::<FileRecord>::count_all(&store).unwrap(), 0);

        let err = store.delete(&package).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_constraint_violations_are_integrity_errors() {
        let store = store();
        let package = demo_package(&store);

        let err = Repository::<PackageRecord>::insert(&store, NewPackage::new("demo", "{}"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));

        let err = Repository::<FileRecord>::insert(&store, NewFile::new(9_999, "a.json", "h"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));

        let _: FileRecord = store.insert(NewFile::new(package.id, "a.json", "h")).unwrap();
        let err = Repository::<FileRecord>::insert(&store, NewFile::new(package.id, "a.json", "x"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));
    }

    #[test]
    fn test_find_files_for_package_sorted_by_path() {
        let store = store();
        let package = demo_package(&store);
        for path in ["z.json", "a.json", "items/m.json"] {
            let _: FileRecord = store.insert(NewFile::new(package.id, path, "h")).unwrap();
        }

        let paths: Vec<String> = store
            .find_files_for_package(package.id)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["a.json", "items/m.json", "z.json"]);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = store();

        let result: crate::Result<()> = store.transaction(|tx| {
            let package: PackageRecord = tx.insert(NewPackage::new("demo", "{}"))?;
            let _: FileRecord = tx.insert(NewFile::new(package.id, "a.json", "h1"))?;
            Err(VaultError::validation("abort"))
        });
        assert!(result.unwrap_err().is_validation());

        assert!(store.find_package_by_name("demo").unwrap().is_none());
        assert_eq!(Repository::<FileRecord>::count_all(&store).unwrap(), 0);
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let store = store();

        let id = store
            .transaction(|tx| {
                let package: PackageRecord = tx.insert(NewPackage::new("demo", "{}"))?;
                let _: FileRecord = tx.insert(NewFile::new(package.id, "a.json", "h1"))?;
                Ok(package.id)
            })
            .unwrap();

        assert_eq!(store.find_files_for_package(id).unwrap().len(), 1);
    }

    #[test]
    fn test_reset_clears_rows_and_keeps_schema() {
        let store = store();
        let package = demo_package(&store);
        let _: FileRecord = store.insert(NewFile::new(package.id, "a.json", "h1")).unwrap();

        store.reset().unwrap();

        assert_eq!(Repository::<PackageRecord>::count_all(&store).unwrap(), 0);
        let again = demo_package(&store);
        assert_eq!(again.id, 1);
    }

    #[test]
    fn test_destroy_removes_database_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("registry.db");

        let store = SqliteStore::open(&db_path).unwrap();
        demo_package(&store);
        assert_eq!(store.path(), Some(db_path.as_path()));
        assert!(db_path.exists());

        store.destroy().unwrap();
        assert!(!db_path.exists());
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("registry.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            demo_package(&store);
        }

        let store = SqliteStore::open(&db_path).unwrap();
        assert!(store.find_package_by_name("demo").unwrap().is_some());
    }
}
