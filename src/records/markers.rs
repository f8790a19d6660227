// Counter markers: MarkersTable
// One row per record, created lazily the first time a counter gets a point.
// Each counter column holds a JSON list of {"x","y"} points.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{value_text, RecordStore};
use crate::constants::*;
use crate::db::{quote_ident, table_columns};
use crate::error::{Result, StoreError};
use crate::schema::definition::{SchemaDefinition, ValueType};

/// Marker position, relative to image width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarkerRow {
    pub id: i64,
    pub points: BTreeMap<String, Vec<Point>>,
}

impl MarkerRow {
    pub fn is_empty(&self) -> bool {
        self.points.values().all(Vec::is_empty)
    }
}

fn counter_column(data_label: &str) -> String {
    format!(
        "{} TEXT DEFAULT '{}'",
        quote_ident(data_label),
        DEFAULT_MARKER_VALUE
    )
}

pub(crate) fn create_markers_table(conn: &Connection, schema: &SchemaDefinition) -> Result<()> {
    let mut columns = vec![format!("{} INTEGER PRIMARY KEY", ID)];
    columns.extend(schema.counters().map(|f| counter_column(&f.data_label)));
    columns.push(format!(
        "FOREIGN KEY ({id}) REFERENCES {dt} ({id}) ON DELETE CASCADE",
        id = ID,
        dt = DATA_TABLE
    ));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        MARKERS_TABLE,
        columns.join(", ")
    ))?;
    Ok(())
}

pub(crate) fn add_counter_column(conn: &Connection, data_label: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {}",
        MARKERS_TABLE,
        counter_column(data_label)
    ))?;
    Ok(())
}

pub(crate) fn rename_counter_column(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        MARKERS_TABLE,
        quote_ident(from),
        quote_ident(to)
    ))?;
    Ok(())
}

/// Drop a counter's column, then delete rows left without any point.
/// Returns the number of rows deleted.
pub(crate) fn drop_counter_column(conn: &Connection, data_label: &str, remaining: &[String]) -> Result<usize> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        MARKERS_TABLE,
        quote_ident(data_label)
    ))?;
    delete_empty_rows(conn, remaining)
}

pub(crate) fn delete_empty_rows(conn: &Connection, counters: &[String]) -> Result<usize> {
    let condition = if counters.is_empty() {
        "1 = 1".to_string()
    } else {
        counters
            .iter()
            .map(|c| {
                let col = quote_ident(c);
                format!("({c} IS NULL OR {c} IN ('', '{empty}'))", c = col, empty = DEFAULT_MARKER_VALUE)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    let deleted = conn.execute(&format!("DELETE FROM {} WHERE {}", MARKERS_TABLE, condition), [])?;
    if deleted > 0 {
        log::debug!("Deleted {} empty marker rows", deleted);
    }
    Ok(deleted)
}

fn parse_points(text: &str) -> Result<Vec<Point>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(text)?)
}

impl RecordStore {
    pub fn markers(&self, id: i64) -> Result<Option<MarkerRow>> {
        let columns = table_columns(&self.conn, "main", MARKERS_TABLE)?;
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", MARKERS_TABLE, ID);
        let values: Option<Vec<String>> = self
            .conn
            .query_row(&sql, params![id], |row| {
                (0..columns.len()).map(|i| Ok(value_text(row.get_ref(i)?))).collect()
            })
            .optional()?;
        let Some(values) = values else {
            return Ok(None);
        };
        let mut row = MarkerRow { id, points: BTreeMap::new() };
        for (column, text) in columns.iter().zip(values) {
            if column != ID {
                row.points.insert(column.clone(), parse_points(&text)?);
            }
        }
        Ok(Some(row))
    }

    /// Replace the points of one counter, creating the marker row if needed.
    pub fn set_markers(&mut self, id: i64, counter: &str, points: &[Point]) -> Result<()> {
        let field = self.schema.require(counter)?;
        if field.value_type != ValueType::Counter {
            return Err(StoreError::InvalidValue {
                label: counter.to_string(),
                value: "markers on a non-counter field".to_string(),
            });
        }
        if self.get(id)?.is_none() {
            return Err(StoreError::RecordNotFound(id));
        }
        self.backup_if_due()?;
        let json = serde_json::to_string(points)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("INSERT OR IGNORE INTO {} ({}) VALUES (?1)", MARKERS_TABLE, ID),
            params![id],
        )?;
        tx.execute(
            &format!("UPDATE {} SET {} = ?1 WHERE {} = ?2", MARKERS_TABLE, quote_ident(counter), ID),
            params![json, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn marker_row_count(&self) -> Result<usize> {
        Ok(crate::db::row_count(&self.conn, "main", MARKERS_TABLE)? as usize)
    }
}
