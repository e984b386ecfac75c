/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::{IoResultExt, VaultError};
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn test_vault_error_display() {
        let error = VaultError::validation("missing manifest");
        assert_eq!(error.to_string(), "Validation error: missing manifest");

        let error = VaultError::not_found("package 'demo'");
        assert_eq!(error.to_string(), "Not found: package 'demo'");

        let error = VaultError::integrity("foreign key violation");
        assert_eq!(error.to_string(), "Integrity error: foreign key violation");
    }

    #[test]
    fn test_io_error_carries_path() {
        let error = VaultError::io(
            "/mods/demo/a.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );

        match &error {
            VaultError::Io { path, source } => {
                assert_eq!(path, &PathBuf::from("/mods/demo/a.json"));
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Io error variant, got {other:?}"),
        }
        assert!(error.to_string().contains("/mods/demo/a.json"));
    }

    #[test]
    fn test_at_path_extension() {
        let result: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "nope"));
        let error = result.at_path("some/file").unwrap_err();
        assert!(matches!(error, VaultError::Io { .. }));
    }

    #[test]
    fn test_vault_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let vault_error = VaultError::from(json_error);

        match vault_error {
            VaultError::Json(_) => {} // Expected
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_constraint_violation_maps_to_integrity() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT NOT NULL UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err();

        let mapped = VaultError::from_store(err, "insert t");
        assert!(matches!(mapped, VaultError::Integrity(_)));
    }

    #[test]
    fn test_predicates() {
        assert!(VaultError::validation("x").is_validation());
        assert!(VaultError::not_found("x").is_not_found());
        assert!(!VaultError::integrity("x").is_validation());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VaultError>();
        assert_sync::<VaultError>();
    }
}
