// Schema store: persists a SchemaDefinition in a template table
// The image template lives in TemplateTable; each folder level template
// lives in FolderDataTemplateTable rows tagged with their Level.

use rusqlite::{params, Connection, Row};

use crate::constants::*;
use crate::db::{quote_ident, table_exists, table_exists_in};
use crate::error::{Result, StoreError};
use crate::schema::definition::{decode_choices, encode_choices, flag_text, parse_flag, FieldDescriptor, SchemaDefinition, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScope {
    Image,
    Level(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaStore {
    scope: TemplateScope,
}

const FIELD_COLUMNS: &str = "ControlOrder, SpreadsheetOrder, Type, DefaultValue, Label, DataLabel, \
                             Tooltip, TextBoxWidth, Copyable, Visible, List, ExportToCSV";

impl SchemaStore {
    pub fn image() -> Self {
        Self { scope: TemplateScope::Image }
    }

    pub fn level(level: i64) -> Self {
        Self { scope: TemplateScope::Level(level) }
    }

    pub fn scope(&self) -> TemplateScope {
        self.scope
    }

    fn table(&self) -> &'static str {
        match self.scope {
            TemplateScope::Image => TEMPLATE_TABLE,
            TemplateScope::Level(_) => FOLDER_TEMPLATE_TABLE,
        }
    }

    /// `WHERE` clause restricting rows to this scope, with `?N` bound to
    /// [`Self::level_param`]. TemplateTable has no Level column; the image
    /// scope binds 0 and the clause is always true.
    fn scope_filter(&self, param: usize) -> String {
        match self.scope {
            TemplateScope::Image => format!("?{} = 0", param),
            TemplateScope::Level(_) => format!("{} = ?{}", LEVEL, param),
        }
    }

    fn level_param(&self) -> i64 {
        match self.scope {
            TemplateScope::Image => 0,
            TemplateScope::Level(level) => level,
        }
    }

    /// Create the folder template table when this is a level scope.
    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        if let TemplateScope::Level(_) = self.scope {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS FolderDataTemplateTable (
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
                    ExportToCSV TEXT,
                    Level INTEGER
                );",
            )?;
        }
        Ok(())
    }

    /// Load the definition, sorted by control order.
    pub fn load(&self, conn: &Connection) -> Result<SchemaDefinition> {
        self.load_from(conn, "main")
    }

    /// Load from the database attached under `schema`.
    pub fn load_from(&self, conn: &Connection, schema: &str) -> Result<SchemaDefinition> {
        if !table_exists_in(conn, schema, self.table())? {
            return Ok(SchemaDefinition::new());
        }
        let sql = format!(
            "SELECT {} FROM {}.{} WHERE {} ORDER BY ControlOrder, Id",
            FIELD_COLUMNS,
            schema,
            self.table(),
            self.scope_filter(1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let fields = stmt
            .query_map(params![self.level_param()], row_to_field)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let fields = fields.into_iter().collect::<Result<Vec<_>>>()?;
        SchemaDefinition::from_fields(fields)
    }

    /// Replace every stored row of this scope with `schema`.
    pub fn save(&self, conn: &Connection, schema: &SchemaDefinition) -> Result<()> {
        self.ensure_table(conn)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.table(), self.scope_filter(1));
        conn.execute(&sql, params![self.level_param()])?;
        for field in schema.fields() {
            self.insert_row(conn, field)?;
        }
        Ok(())
    }

    fn insert_row(&self, conn: &Connection, f: &FieldDescriptor) -> Result<()> {
        let (columns, level_placeholder) = match self.scope {
            TemplateScope::Image => (FIELD_COLUMNS.to_string(), String::new()),
            TemplateScope::Level(_) => (format!("{}, {}", FIELD_COLUMNS, LEVEL), ", ?13".to_string()),
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12{})",
            self.table(),
            columns,
            level_placeholder
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(f.control_order),
            Box::new(f.spreadsheet_order),
            Box::new(f.value_type.as_str()),
            Box::new(f.default_value.clone()),
            Box::new(f.label.clone()),
            Box::new(f.data_label.clone()),
            Box::new(f.tooltip.clone()),
            Box::new(f.width),
            Box::new(flag_text(f.copyable)),
            Box::new(flag_text(f.visible)),
            Box::new(encode_choices(&f.choices)),
            Box::new(flag_text(f.exportable)),
        ];
        if let TemplateScope::Level(level) = self.scope {
            values.push(Box::new(level));
        }
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|p| p.as_ref()).collect();
        conn.execute(&sql, refs.as_slice())?;
        Ok(())
    }

    /// Append a field to the definition and persist it.
    pub fn add_field(&self, conn: &Connection, schema: &mut SchemaDefinition, field: FieldDescriptor) -> Result<FieldDescriptor> {
        let added = schema.add(field)?.clone();
        self.ensure_table(conn)?;
        self.insert_row(conn, &added)?;
        Ok(added)
    }

    /// Remove a field and close the gap in both order indices.
    pub fn remove_field(&self, conn: &Connection, schema: &mut SchemaDefinition, data_label: &str) -> Result<FieldDescriptor> {
        let removed = schema.remove(data_label)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1 AND {}",
            self.table(),
            DATA_LABEL,
            self.scope_filter(2)
        );
        conn.execute(&sql, params![data_label, self.level_param()])?;
        self.write_orders(conn, schema)?;
        Ok(removed)
    }

    /// Rename a field's data label in place.
    pub fn rename_field(&self, conn: &Connection, schema: &mut SchemaDefinition, from: &str, to: &str) -> Result<()> {
        schema.rename(from, to)?;
        let label = schema.require(to)?.label.clone();
        let sql = format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3 AND {}",
            self.table(),
            DATA_LABEL,
            LABEL,
            DATA_LABEL,
            self.scope_filter(4)
        );
        conn.execute(&sql, params![to, label, from, self.level_param()])?;
        Ok(())
    }

    /// Replace a field's display attributes. Data label and type must match
    /// the stored field.
    pub fn update_field(&self, conn: &Connection, schema: &mut SchemaDefinition, field: &FieldDescriptor) -> Result<()> {
        let existing = schema
            .get_mut(&field.data_label)
            .ok_or_else(|| StoreError::UnknownField(field.data_label.clone()))?;
        if existing.value_type != field.value_type {
            return Err(StoreError::SchemaTypeConflict {
                label: field.data_label.clone(),
                expected: existing.value_type.to_string(),
                found: field.value_type.to_string(),
            });
        }
        existing.copy_cosmetics_from(field);
        let f = existing.clone();
        let sql = format!(
            "UPDATE {} SET DefaultValue = ?1, Label = ?2, Tooltip = ?3, TextBoxWidth = ?4, Copyable = ?5, \
             Visible = ?6, List = ?7, ExportToCSV = ?8 WHERE {} = ?9 AND {}",
            self.table(),
            DATA_LABEL,
            self.scope_filter(10)
        );
        conn.execute(
            &sql,
            params![
                f.default_value,
                f.label,
                f.tooltip,
                f.width,
                flag_text(f.copyable),
                flag_text(f.visible),
                encode_choices(&f.choices),
                flag_text(f.exportable),
                f.data_label,
                self.level_param()
            ],
        )?;
        schema.renumber();
        self.write_orders(conn, schema)
    }

    /// Persist both order indices for every field of `schema`.
    pub fn write_orders(&self, conn: &Connection, schema: &SchemaDefinition) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3 AND {}",
            self.table(),
            quote_ident(CONTROL_ORDER),
            quote_ident(SPREADSHEET_ORDER),
            DATA_LABEL,
            self.scope_filter(4)
        );
        let mut stmt = conn.prepare(&sql)?;
        for f in schema.fields() {
            stmt.execute(params![f.control_order, f.spreadsheet_order, f.data_label, self.level_param()])?;
        }
        Ok(())
    }

    /// Drop every row of this scope (used when a level is removed).
    pub fn clear(&self, conn: &Connection) -> Result<()> {
        if table_exists(conn, self.table())? {
            let sql = format!("DELETE FROM {} WHERE {}", self.table(), self.scope_filter(1));
            conn.execute(&sql, params![self.level_param()])?;
        }
        Ok(())
    }
}

fn row_to_field(row: &Row) -> rusqlite::Result<Result<FieldDescriptor>> {
    let type_text: String = row.get(2)?;
    let Some(value_type) = ValueType::parse(&type_text) else {
        return Ok(Err(StoreError::StoreCorrupt(format!("unknown field type '{}'", type_text))));
    };
    let text = |i: usize| -> rusqlite::Result<String> { Ok(row.get::<_, Option<String>>(i)?.unwrap_or_default()) };
    let flag = |i: usize, default: bool| -> rusqlite::Result<bool> {
        Ok(row
            .get::<_, Option<String>>(i)?
            .and_then(|v| parse_flag(&v))
            .unwrap_or(default))
    };
    Ok(Ok(FieldDescriptor {
        control_order: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
        spreadsheet_order: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        value_type,
        default_value: text(3)?,
        label: text(4)?,
        data_label: text(5)?,
        tooltip: text(6)?,
        width: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        copyable: flag(8, true)?,
        visible: flag(9, true)?,
        choices: decode_choices(&text(10)?),
        exportable: flag(11, true)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;

    fn setup() -> (Connection, SchemaDefinition) {
        let conn = open_memory_db().unwrap();
        let mut schema = SchemaDefinition::image_template();
        schema
            .add(FieldDescriptor::new("Species", ValueType::FixedChoice).with_choices(["Deer", "Elk"]))
            .unwrap();
        schema.add(FieldDescriptor::new("Count", ValueType::Counter)).unwrap();
        SchemaStore::image().save(&conn, &schema).unwrap();
        (conn, schema)
    }

    #[test]
    fn test_save_and_reload() {
        let (conn, schema) = setup();
        let loaded = SchemaStore::image().load(&conn).unwrap();
        assert_eq!(loaded, schema);
        assert_eq!(loaded.get("Species").unwrap().choices, vec!["Deer", "Elk"]);
    }

    #[test]
    fn test_remove_keeps_orders_contiguous_on_disk() {
        let (conn, mut schema) = setup();
        let store = SchemaStore::image();
        store.remove_field(&conn, &mut schema, "Species").unwrap();
        let loaded = store.load(&conn).unwrap();
        let orders: Vec<(i64, i64)> = loaded
            .fields()
            .iter()
            .map(|f| (f.control_order, f.spreadsheet_order))
            .collect();
        assert_eq!(orders, vec![(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]);
        assert!(!loaded.contains("Species"));
    }

    #[test]
    fn test_rename_and_update() {
        let (conn, mut schema) = setup();
        let store = SchemaStore::image();
        store.rename_field(&conn, &mut schema, "Count", "Individuals").unwrap();

        let mut changed = schema.get("Individuals").unwrap().clone();
        changed.tooltip = "How many animals".into();
        changed.visible = false;
        store.update_field(&conn, &mut schema, &changed).unwrap();

        let loaded = store.load(&conn).unwrap();
        let f = loaded.get("Individuals").unwrap();
        assert_eq!(f.tooltip, "How many animals");
        assert!(!f.visible);
        assert_eq!(f.value_type, ValueType::Counter);

        let mut wrong = f.clone();
        wrong.value_type = ValueType::Note;
        assert!(matches!(
            store.update_field(&conn, &mut schema, &wrong),
            Err(StoreError::SchemaTypeConflict { .. })
        ));
    }

    #[test]
    fn test_level_scopes_are_separate() {
        let conn = open_memory_db().unwrap();
        let mut one = SchemaDefinition::new();
        one.add(FieldDescriptor::new("Site", ValueType::Text)).unwrap();
        let mut two = SchemaDefinition::new();
        two.add(FieldDescriptor::new("Camera", ValueType::Text)).unwrap();
        two.add(FieldDescriptor::new("Bait", ValueType::Flag)).unwrap();
        SchemaStore::level(1).save(&conn, &one).unwrap();
        SchemaStore::level(2).save(&conn, &two).unwrap();

        assert_eq!(SchemaStore::level(1).load(&conn).unwrap().data_labels(), vec!["Site"]);
        assert_eq!(SchemaStore::level(2).load(&conn).unwrap().len(), 2);
        SchemaStore::level(2).clear(&conn).unwrap();
        assert!(SchemaStore::level(2).load(&conn).unwrap().is_empty());
        assert_eq!(SchemaStore::level(1).load(&conn).unwrap().len(), 1);
    }
}
