// Folder metadata levels
// Level n describes folders at depth n below the root. FolderDataInfo holds
// one row per level, FolderDataTemplateTable its fields, and Level<n> one
// row per folder keyed by FolderDataPath.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;

use crate::constants::*;
use crate::db::{level_table_name, quote_ident, table_columns, table_exists};
use crate::error::{Result, StoreError};
use crate::records::{column_definition, value_text, FieldUpdate, RecordStore};
use crate::schema::definition::{FieldDescriptor, SchemaDefinition};
use crate::schema::store::SchemaStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelDescriptor {
    pub level: i64,
    pub guid: String,
    pub alias: String,
    pub schema: SchemaDefinition,
}

impl LevelDescriptor {
    /// A new level with a fresh guid.
    pub fn new(level: i64, alias: impl Into<String>, schema: SchemaDefinition) -> Self {
        Self {
            level,
            guid: uuid::Uuid::new_v4().to_string(),
            alias: alias.into(),
            schema,
        }
    }

    /// Same level in another store: equal guid, or equal non-empty alias.
    pub fn matches(&self, other: &LevelDescriptor) -> bool {
        self.guid == other.guid || (!self.alias.is_empty() && self.alias == other.alias)
    }

    pub fn name(&self) -> &str {
        if self.alias.is_empty() {
            &self.guid
        } else {
            &self.alias
        }
    }
}

/// One folder's row in a level table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelRow {
    pub id: i64,
    pub folder_data_path: String,
    pub fields: BTreeMap<String, String>,
}

pub(crate) fn ensure_info_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS FolderDataInfo (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Level INTEGER,
            Guid TEXT,
            Alias TEXT
        );",
    )?;
    Ok(())
}

/// Every level of the store in level order.
pub fn load_levels(conn: &Connection) -> Result<Vec<LevelDescriptor>> {
    load_levels_from(conn, "main")
}

/// Levels of the store attached under `schema`.
pub(crate) fn load_levels_from(conn: &Connection, schema: &str) -> Result<Vec<LevelDescriptor>> {
    if !crate::db::table_exists_in(conn, schema, FOLDER_INFO_TABLE)? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {}, {}, {} FROM {}.{} ORDER BY {}",
        LEVEL, GUID, ALIAS, schema, FOLDER_INFO_TABLE, LEVEL
    );
    let mut stmt = conn.prepare(&sql)?;
    let infos = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut levels = Vec::with_capacity(infos.len());
    for (level, guid, alias) in infos {
        let schema_def = SchemaStore::level(level).load_from(conn, schema)?;
        levels.push(LevelDescriptor {
            level,
            guid,
            alias,
            schema: schema_def,
        });
    }
    Ok(levels)
}

/// Write the info row, template rows and the level table.
pub(crate) fn create_level_in(conn: &Connection, level: &LevelDescriptor) -> Result<()> {
    ensure_info_table(conn)?;
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
            FOLDER_INFO_TABLE, LEVEL, GUID, ALIAS
        ),
        params![level.level, level.guid, level.alias],
    )?;
    SchemaStore::level(level.level).save(conn, &level.schema)?;
    create_level_table(conn, level.level, &level.schema)?;
    log::debug!("Created level {} ({})", level.level, level.name());
    Ok(())
}

pub(crate) fn create_level_table(conn: &Connection, level: i64, schema: &SchemaDefinition) -> Result<()> {
    let mut columns = vec![
        format!("{} INTEGER PRIMARY KEY", ID),
        format!("{} TEXT", FOLDER_DATA_PATH),
    ];
    columns.extend(schema.fields().iter().map(column_definition));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&level_table_name(level)),
        columns.join(", ")
    ))?;
    Ok(())
}

pub(crate) fn add_level_field_in(
    conn: &Connection,
    level: i64,
    schema: &mut SchemaDefinition,
    field: FieldDescriptor,
) -> Result<FieldDescriptor> {
    let added = SchemaStore::level(level).add_field(conn, schema, field)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(&level_table_name(level)),
        column_definition(&added)
    ))?;
    Ok(added)
}

pub(crate) fn remove_level_field_in(
    conn: &Connection,
    level: i64,
    schema: &mut SchemaDefinition,
    data_label: &str,
) -> Result<FieldDescriptor> {
    let removed = SchemaStore::level(level).remove_field(conn, schema, data_label)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(&level_table_name(level)),
        quote_ident(data_label)
    ))?;
    Ok(removed)
}

fn read_level_rows(conn: &Connection, level: i64, condition: &str, values: &[&dyn ToSql]) -> Result<Vec<LevelRow>> {
    let table = level_table_name(level);
    if !table_exists(conn, &table)? {
        return Ok(Vec::new());
    }
    let columns = table_columns(conn, "main", &table)?;
    let sql = format!(
        "SELECT * FROM {} WHERE {} ORDER BY {}",
        quote_ident(&table),
        condition,
        ID
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(values, |row| {
            let mut out = LevelRow {
                id: row.get(0)?,
                folder_data_path: String::new(),
                fields: BTreeMap::new(),
            };
            for (i, column) in columns.iter().enumerate().skip(1) {
                let value = value_text(row.get_ref(i)?);
                if column == FOLDER_DATA_PATH {
                    out.folder_data_path = value;
                } else {
                    out.fields.insert(column.clone(), value);
                }
            }
            Ok(out)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl RecordStore {
    pub fn levels(&self) -> Result<Vec<LevelDescriptor>> {
        load_levels(self.conn())
    }

    /// Append a level below the current deepest one.
    pub fn add_level(&mut self, alias: &str, schema: SchemaDefinition) -> Result<LevelDescriptor> {
        if schema.fields().iter().any(FieldDescriptor::is_structural) {
            return Err(StoreError::SchemaMismatch(
                "folder level templates cannot hold standard fields".to_string(),
            ));
        }
        let next = self.levels()?.last().map_or(1, |l| l.level + 1);
        let descriptor = LevelDescriptor::new(next, alias, schema);
        self.backup_if_due()?;
        let tx = self.conn_mut().transaction()?;
        create_level_in(&tx, &descriptor)?;
        tx.commit()?;
        log::info!("Added folder level {} ({})", descriptor.level, descriptor.name());
        Ok(descriptor)
    }

    pub fn level_rows(&self, level: i64) -> Result<Vec<LevelRow>> {
        read_level_rows(self.conn(), level, "1 = 1", &[])
    }

    pub fn level_row(&self, level: i64, folder_data_path: &str) -> Result<Option<LevelRow>> {
        let condition = format!("{} = ?1", FOLDER_DATA_PATH);
        Ok(read_level_rows(self.conn(), level, &condition, &[&folder_data_path])?
            .into_iter()
            .next())
    }

    /// Insert the folder's row, or update it when the path is already present.
    /// Returns the row id.
    pub fn upsert_level_row(&mut self, level: i64, folder_data_path: &str, values: &[FieldUpdate]) -> Result<i64> {
        let descriptor = self
            .levels()?
            .into_iter()
            .find(|l| l.level == level)
            .ok_or_else(|| StoreError::MetadataLevelMismatch(format!("no folder level {}", level)))?;
        let mut assignments: Vec<(String, String)> = Vec::with_capacity(values.len());
        for v in values {
            let field = descriptor.schema.require(&v.data_label)?;
            assignments.push((v.data_label.clone(), field.normalize(&v.value)?));
        }

        self.backup_if_due()?;
        let table = quote_ident(&level_table_name(level));
        let tx = self.conn_mut().transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT {} FROM {} WHERE {} = ?1", ID, table, FOLDER_DATA_PATH),
                params![folder_data_path],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    &format!("INSERT INTO {} ({}) VALUES (?1)", table, FOLDER_DATA_PATH),
                    params![folder_data_path],
                )?;
                tx.last_insert_rowid()
            }
        };
        for (column, value) in &assignments {
            tx.execute(
                &format!("UPDATE {} SET {} = ?1 WHERE {} = ?2", table, quote_ident(column), ID),
                params![value, id],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Point a folder's row at a new path. Returns the rows changed.
    pub fn rename_level_path(&mut self, level: i64, old_path: &str, new_path: &str) -> Result<usize> {
        let table = level_table_name(level);
        if !table_exists(self.conn(), &table)? {
            return Ok(0);
        }
        self.backup_if_due()?;
        Ok(self.conn().execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(&table),
                FOLDER_DATA_PATH,
                FOLDER_DATA_PATH
            ),
            params![new_path, old_path],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::definition::ValueType;

    fn site_schema() -> SchemaDefinition {
        let mut s = SchemaDefinition::new();
        s.add(FieldDescriptor::new("Habitat", ValueType::FixedChoice).with_choices(["Forest", "Meadow"]))
            .unwrap();
        s.add(FieldDescriptor::new("Elevation", ValueType::Counter)).unwrap();
        s
    }

    fn store_with_levels() -> RecordStore {
        let mut store = RecordStore::create_in_memory(&SchemaDefinition::image_template(), StoreConfig::for_tests()).unwrap();
        store.add_level("Site", site_schema()).unwrap();
        let mut camera = SchemaDefinition::new();
        camera.add(FieldDescriptor::new("Model", ValueType::Text)).unwrap();
        store.add_level("Camera", camera).unwrap();
        store
    }

    #[test]
    fn test_levels_are_numbered_in_order() {
        let store = store_with_levels();
        let levels = store.levels().unwrap();
        assert_eq!(levels.iter().map(|l| l.level).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(levels[0].alias, "Site");
        assert_eq!(levels[0].schema, site_schema());
        assert_ne!(levels[0].guid, levels[1].guid);
        assert_eq!(
            table_columns(store.conn(), "main", "Level1").unwrap(),
            vec!["Id", "FolderDataPath", "Habitat", "Elevation"]
        );
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let mut store = store_with_levels();
        let id = store
            .upsert_level_row(1, "North", &[FieldUpdate::new("Habitat", "Forest")])
            .unwrap();
        let again = store
            .upsert_level_row(1, "North", &[FieldUpdate::new("Elevation", "1200")])
            .unwrap();
        assert_eq!(id, again);

        let row = store.level_row(1, "North").unwrap().unwrap();
        assert_eq!(row.fields["Habitat"], "Forest");
        assert_eq!(row.fields["Elevation"], "1200");
        assert_eq!(store.level_rows(1).unwrap().len(), 1);

        assert!(matches!(
            store.upsert_level_row(1, "South", &[FieldUpdate::new("Habitat", "Desert")]),
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.upsert_level_row(5, "South", &[]),
            Err(StoreError::MetadataLevelMismatch(_))
        ));
    }

    #[test]
    fn test_rename_path_and_standard_fields_rejected() {
        let mut store = store_with_levels();
        store.upsert_level_row(2, "North\\Cam1", &[]).unwrap();
        assert_eq!(store.rename_level_path(2, "North\\Cam1", "North\\CamA").unwrap(), 1);
        assert!(store.level_row(2, "North\\CamA").unwrap().is_some());

        let mut bad = SchemaDefinition::new();
        bad.add(FieldDescriptor::new(FILE, ValueType::File)).unwrap();
        assert!(store.add_level("Bad", bad).is_err());
    }

    #[test]
    fn test_descriptor_matching() {
        let a = LevelDescriptor::new(1, "Site", SchemaDefinition::new());
        let b = LevelDescriptor::new(1, "Site", SchemaDefinition::new());
        let c = LevelDescriptor::new(1, "", SchemaDefinition::new());
        let d = LevelDescriptor::new(1, "", SchemaDefinition::new());
        assert!(a.matches(&b));
        assert!(!c.matches(&d));
        let mut e = d.clone();
        e.alias = "Other".into();
        assert!(d.matches(&e));
    }
}
