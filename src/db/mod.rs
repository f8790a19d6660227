// Database module

pub mod migrations;

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::constants::{DATA_TABLE, LEVEL_TABLE_PREFIX, TEMPLATE_TABLE};
use crate::error::{Result, StoreError};

/// Alias under which a second store is attached during merge and checkout.
pub const ATTACHED: &str = "other";

fn configure(conn: &Connection) -> Result<()> {
    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

/// Open an existing store file.
/// A file that is not a database is `StoreUnreadable`; a database without
/// the template and data tables is `StoreCorrupt`.
pub fn open_store_db(db_path: &Path) -> Result<Connection> {
    if !db_path.is_file() {
        return Err(StoreError::StoreUnreadable(format!(
            "{} does not exist",
            db_path.display()
        )));
    }
    let conn = Connection::open(db_path)
        .map_err(|e| StoreError::StoreUnreadable(format!("{}: {}", db_path.display(), e)))?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| StoreError::StoreUnreadable(format!("{}: {}", db_path.display(), e)))?;

    for table in [TEMPLATE_TABLE, DATA_TABLE] {
        if !table_exists(&conn, table)? {
            return Err(StoreError::StoreCorrupt(format!(
                "{} has no {} table",
                db_path.display(),
                table
            )));
        }
    }

    configure(&conn)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

/// Create a new, empty store file. Fails if the file already exists.
pub fn create_store_db(db_path: &Path) -> Result<Connection> {
    if db_path.exists() {
        return Err(StoreError::StoreUnreadable(format!(
            "{} already exists",
            db_path.display()
        )));
    }
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

/// In-memory store connection, used by tests and scratch work.
pub fn open_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

/// Quote an identifier for SQL: `"name"` with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualified identifier `schema."table"`.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, quote_ident(table))
}

pub fn level_table_name(level: i64) -> String {
    format!("{}{}", LEVEL_TABLE_PREFIX, level)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    table_exists_in(conn, "main", table)
}

pub fn table_exists_in(conn: &Connection, schema: &str, table: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        schema
    );
    let found: Option<i64> = conn.query_row(&sql, params![table], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

/// Column names of a table in declaration order.
pub fn table_columns(conn: &Connection, schema: &str, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table, schema], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(columns)
}

/// Largest value of an integer column, 0 for an empty table.
pub fn max_value(conn: &Connection, schema: &str, table: &str, column: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(MAX({}), 0) FROM {}",
        quote_ident(column),
        qualified(schema, table)
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

pub fn row_count(conn: &Connection, schema: &str, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", qualified(schema, table));
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Attach another store file under [`ATTACHED`].
pub fn attach(conn: &Connection, path: &Path) -> Result<()> {
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {}", ATTACHED),
        params![path.to_string_lossy().into_owned()],
    )?;
    Ok(())
}

pub fn detach(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!("DETACH DATABASE {}", ATTACHED))?;
    Ok(())
}
