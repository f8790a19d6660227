// Store migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.
// They only cover the fixed tables; DataTable, MarkersTable and the level
// tables are shaped by the template and created from it.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// All migrations in order. Each migration is a SQL string.
/// Stores written by older tools have user_version 0 but already carry these
/// tables, hence IF NOT EXISTS.
const MIGRATIONS: &[&str] = &[
    // Migration 1: fixed tables
    r#"
    CREATE TABLE IF NOT EXISTS TemplateTable (
        Id INTEGER PRIMARY KEY AUTOINCREMENT,
        ControlOrder INTEGER,
        SpreadsheetOrder INTEGER,
        Type TEXT,
        DefaultValue TEXT,
        Label TEXT,
        DataLabel TEXT,
        Tooltip TEXT,
        TextBoxWidth INTEGER,
        Copyable TEXT,
        Visible TEXT,
        List TEXT,
        ExportToCSV TEXT
    );

    CREATE TABLE IF NOT EXISTS ImageSetTable (
        Id INTEGER PRIMARY KEY,
        RootFolder TEXT,
        Log TEXT DEFAULT '',
        Row INTEGER DEFAULT 0,
        VersionCompatabily TEXT,
        BackwardsCompatibility TEXT,
        SortTerms TEXT,
        SearchTerms TEXT,
        QuickPasteTerms TEXT,
        BBDisplayThreshold REAL DEFAULT -1
    );
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a store written by a newer build
    if current_version > target_version {
        return Err(StoreError::StoreUnreadable(format!(
            "store version {} is newer than this build supports (max {})",
            current_version, target_version
        )));
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::debug!("Applied migration {}", migration_version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_legacy_store_without_version_is_accepted() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE TemplateTable (Id INTEGER PRIMARY KEY, DataLabel TEXT);")
            .unwrap();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_newer_store_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        assert!(matches!(run_migrations(&conn), Err(StoreError::StoreUnreadable(_))));
    }
}
