// Record store: DataTable and everything keyed by its Id
// One RecordStore owns one connection. Mutating calls take &mut self and
// ask the backup policy first.

pub mod image_set;
pub mod markers;
pub mod query;

#[cfg(test)]
mod tests;

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use serde::Serialize;

use crate::backup::BackupPolicy;
use crate::config::StoreConfig;
use crate::constants::*;
use crate::datetime::{format_date_time, parse_date_time};
use crate::db::{self, quote_ident, table_exists};
use crate::error::{Result, StoreError};
use crate::jobs::{JobContext, JobProgress};
use crate::paths::{absolute_path, sql_under_prefix};
use crate::schema::definition::{flag_text, parse_flag, FieldDescriptor, SchemaDefinition, ValueType};
use crate::schema::store::SchemaStore;

pub use image_set::ImageSetSettings;
pub use markers::{MarkerRow, Point};
pub use query::{JoinMode, Operator, Predicate, RecognitionFilter, RecognitionKind, SelectionSpec, SortKey};
use query::{RecognitionPresence, Terminal};

/// SQLITE_MAX_VARIABLE_NUMBER of the bundled library.
const MAX_SQL_VARIABLES: usize = 32766;
/// Ids per `IN (...)` list.
const ID_CHUNK: usize = 500;

/// One row of DataTable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: i64,
    pub file: String,
    pub relative_path: String,
    pub date_time: NaiveDateTime,
    pub delete_flag: bool,
    /// Non-structural fields by data label.
    pub fields: BTreeMap<String, String>,
}

impl FileRecord {
    /// Stored text of any field, structural ones included.
    pub fn value(&self, data_label: &str) -> Option<String> {
        match data_label {
            FILE => Some(self.file.clone()),
            RELATIVE_PATH => Some(self.relative_path.clone()),
            DATE_TIME => Some(format_date_time(&self.date_time)),
            DELETE_FLAG => Some(flag_text(self.delete_flag).to_string()),
            _ => self.fields.get(data_label).cloned(),
        }
    }
}

/// A record to insert. The store assigns the id; unset fields take their
/// template default.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileRecord {
    pub file: String,
    pub relative_path: String,
    pub date_time: NaiveDateTime,
    pub delete_flag: bool,
    pub fields: BTreeMap<String, String>,
}

impl NewFileRecord {
    pub fn new(relative_path: impl Into<String>, file: impl Into<String>, date_time: NaiveDateTime) -> Self {
        Self {
            file: file.into(),
            relative_path: relative_path.into(),
            date_time,
            delete_flag: false,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, data_label: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(data_label.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub data_label: String,
    pub value: String,
}

impl FieldUpdate {
    pub fn new(data_label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            data_label: data_label.into(),
            value: value.into(),
        }
    }
}

/// All updates for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub id: i64,
    pub updates: Vec<FieldUpdate>,
}

impl RecordUpdate {
    pub fn new(id: i64) -> Self {
        Self { id, updates: Vec::new() }
    }

    pub fn set(mut self, data_label: impl Into<String>, value: impl Into<String>) -> Self {
        self.updates.push(FieldUpdate::new(data_label, value));
        self
    }
}

/// Result of a batched write. Batches committed before a cancellation stay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub applied: usize,
    pub cancelled: bool,
}

pub struct RecordStore {
    conn: Connection,
    path: Option<PathBuf>,
    schema: SchemaDefinition,
    schema_store: SchemaStore,
    config: StoreConfig,
    backup: BackupPolicy,
    detections_cache: Cell<Option<bool>>,
}

impl RecordStore {
    // ----- Lifecycle -----

    /// Create a new store file holding `template` and no records.
    pub fn create(path: &Path, template: &SchemaDefinition, config: StoreConfig) -> Result<Self> {
        let conn = db::create_store_db(path)?;
        let root_folder = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        initialize(&conn, template, &root_folder)?;
        log::info!("Created store {}", path.display());
        Self::from_parts(conn, Some(path.to_path_buf()), config)
    }

    /// Store that lives only as long as the value. Never backed up.
    pub fn create_in_memory(template: &SchemaDefinition, config: StoreConfig) -> Result<Self> {
        let conn = db::open_memory_db()?;
        initialize(&conn, template, "")?;
        Self::from_parts(conn, None, config)
    }

    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        let conn = db::open_store_db(path)?;
        let store = Self::from_parts(conn, Some(path.to_path_buf()), config)?;
        log::debug!("Opened store {} ({} fields)", path.display(), store.schema.len());
        Ok(store)
    }

    fn from_parts(conn: Connection, path: Option<PathBuf>, config: StoreConfig) -> Result<Self> {
        let schema_store = SchemaStore::image();
        let schema = schema_store.load(&conn)?;
        if !schema.has_standard_fields() {
            return Err(StoreError::StoreCorrupt(format!(
                "{} lacks the standard fields",
                TEMPLATE_TABLE
            )));
        }
        markers::create_markers_table(&conn, &schema)?;
        let backup = match &path {
            Some(p) => BackupPolicy::for_store(&config, p),
            None => BackupPolicy::new(&config),
        };
        Ok(Self {
            conn,
            path,
            schema,
            schema_store,
            config,
            backup,
            detections_cache: Cell::new(None),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Snapshot the store when the backup interval has elapsed.
    pub fn backup_if_due(&mut self) -> Result<Option<PathBuf>> {
        self.backup.backup_if_due(&self.conn, self.path.as_deref())
    }

    /// Snapshot now, regardless of the interval. None for in-memory stores.
    pub fn backup_now(&mut self) -> Result<Option<PathBuf>> {
        match &self.path {
            Some(path) => Ok(Some(self.backup.backup_now(&self.conn, path)?)),
            None => Ok(None),
        }
    }

    // ----- Detections cache -----

    /// Whether the store holds at least one detection. Cached until
    /// [`Self::invalidate_detections_cache`].
    pub fn has_detections(&self) -> Result<bool> {
        if let Some(cached) = self.detections_cache.get() {
            return Ok(cached);
        }
        let found = table_exists(&self.conn, DETECTIONS_TABLE)?
            && db::row_count(&self.conn, "main", DETECTIONS_TABLE)? > 0;
        self.detections_cache.set(Some(found));
        Ok(found)
    }

    pub fn invalidate_detections_cache(&self) {
        self.detections_cache.set(None);
    }

    fn presence(&self) -> Result<RecognitionPresence> {
        Ok(RecognitionPresence {
            detections: self.has_detections()?,
            classifications: table_exists(&self.conn, CLASSIFICATIONS_TABLE)?,
        })
    }

    // ----- Selection -----

    pub fn select(&self, spec: &SelectionSpec) -> Result<Vec<FileRecord>> {
        let q = query::lower(spec, &self.schema, self.presence()?, Terminal::Rows)?;
        self.read_records(&q.sql, &q.params)
    }

    pub fn select_ids(&self, spec: &SelectionSpec) -> Result<Vec<i64>> {
        Ok(self.select(spec)?.into_iter().map(|r| r.id).collect())
    }

    /// Always equal to `select(spec).len()`.
    pub fn count_matching(&self, spec: &SelectionSpec) -> Result<usize> {
        let q = query::lower(spec, &self.schema, self.presence()?, Terminal::Count)?;
        let count: i64 = self
            .conn
            .query_row(&q.sql, params_from_iter(q.params.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn exists_matching(&self, spec: &SelectionSpec) -> Result<bool> {
        let q = query::lower(spec, &self.schema, self.presence()?, Terminal::Exists)?;
        Ok(self
            .conn
            .query_row(&q.sql, params_from_iter(q.params.iter()), |row| row.get(0))?)
    }

    pub fn count_all(&self) -> Result<usize> {
        Ok(db::row_count(&self.conn, "main", DATA_TABLE)? as usize)
    }

    pub fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT * FROM {} WHERE {} = ?1", DATA_TABLE, ID);
        Ok(self.read_records(&sql, &[Value::Integer(id)])?.into_iter().next())
    }

    fn read_records(&self, sql: &str, params: &[Value]) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let id_index = names
            .iter()
            .position(|n| n == ID)
            .ok_or_else(|| StoreError::StoreCorrupt(format!("{} has no {} column", DATA_TABLE, ID)))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let id: i64 = row.get(id_index)?;
                let mut values = Vec::with_capacity(names.len());
                for i in 0..names.len() {
                    values.push(value_text(row.get_ref(i)?));
                }
                Ok((id, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, values)| self.to_record(id, &names, values))
            .collect()
    }

    fn to_record(&self, id: i64, names: &[String], values: Vec<String>) -> Result<FileRecord> {
        let mut file = String::new();
        let mut relative_path = String::new();
        let mut date_time = None;
        let mut delete_flag = false;
        let mut fields = BTreeMap::new();
        for (name, value) in names.iter().zip(values) {
            match self.schema.get(name).map(|f| f.value_type) {
                Some(ValueType::File) => file = value,
                Some(ValueType::RelativePath) => relative_path = value,
                Some(ValueType::DateTime) => {
                    date_time = Some(parse_date_time(&value).ok_or_else(|| {
                        StoreError::StoreCorrupt(format!("record {} has unreadable {} '{}'", id, name, value))
                    })?)
                }
                Some(ValueType::DeleteFlag) => delete_flag = parse_flag(&value).unwrap_or(false),
                Some(_) => {
                    fields.insert(name.clone(), value);
                }
                None => {}
            }
        }
        let date_time =
            date_time.ok_or_else(|| StoreError::StoreCorrupt(format!("record {} has no {}", id, DATE_TIME)))?;
        Ok(FileRecord {
            id,
            file,
            relative_path,
            date_time,
            delete_flag,
            fields,
        })
    }

    // ----- Insert, update, delete -----

    /// Insert records in batches, one transaction per batch. Every record
    /// is validated before the first batch is written.
    pub fn bulk_insert(&mut self, records: &[NewFileRecord], ctx: &mut JobContext<'_>) -> Result<BatchOutcome> {
        let rows = records
            .iter()
            .map(|r| self.insert_values(r))
            .collect::<Result<Vec<_>>>()?;
        let columns = self
            .schema
            .fields()
            .iter()
            .map(|f| quote_ident(&f.data_label))
            .collect::<Vec<_>>();
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let rows_per_statement = (MAX_SQL_VARIABLES / columns.len().max(1)).max(1);
        let batch_size = self.config.insert_batch_size.max(1);
        let total = rows.len() as u64;

        let mut outcome = BatchOutcome::default();
        for batch in rows.chunks(batch_size) {
            if ctx.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.backup_if_due()?;
            let tx = self.conn.transaction()?;
            for chunk in batch.chunks(rows_per_statement) {
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    DATA_TABLE,
                    columns.join(", "),
                    vec![placeholders.as_str(); chunk.len()].join(", ")
                );
                tx.execute(&sql, params_from_iter(chunk.iter().flatten()))?;
            }
            tx.commit()?;
            outcome.applied += batch.len();
            log::debug!("Inserted batch of {} ({}/{})", batch.len(), outcome.applied, total);
            ctx.report(JobProgress::new("insert", outcome.applied as u64, total));
        }

        let last = JobProgress::new("insert", outcome.applied as u64, total);
        ctx.report(if outcome.cancelled { last.cancelled() } else { last.done() });
        log::info!("Inserted {} of {} records", outcome.applied, total);
        Ok(outcome)
    }

    fn insert_values(&self, record: &NewFileRecord) -> Result<Vec<String>> {
        for label in record.fields.keys() {
            if self.schema.require(label)?.is_structural() {
                return Err(StoreError::StructuralField(label.clone()));
            }
        }
        self.schema
            .fields()
            .iter()
            .map(|f| {
                Ok(match f.value_type {
                    ValueType::File => record.file.clone(),
                    ValueType::RelativePath => record.relative_path.clone(),
                    ValueType::DateTime => format_date_time(&record.date_time),
                    ValueType::DeleteFlag => flag_text(record.delete_flag).to_string(),
                    _ => match record.fields.get(&f.data_label) {
                        Some(value) => f.normalize(value)?,
                        None => f.default_value.clone(),
                    },
                })
            })
            .collect()
    }

    /// Update one existing record. Never inserts.
    pub fn update(&mut self, id: i64, updates: &[FieldUpdate]) -> Result<()> {
        let assignments = self.assignments(updates)?;
        self.backup_if_due()?;
        if update_row(&self.conn, id, &assignments)? == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Apply updates in batches. Ids that do not exist are skipped and not
    /// counted in `applied`.
    pub fn bulk_update(&mut self, updates: &[RecordUpdate], ctx: &mut JobContext<'_>) -> Result<BatchOutcome> {
        let prepared = updates
            .iter()
            .map(|u| Ok((u.id, self.assignments(&u.updates)?)))
            .collect::<Result<Vec<_>>>()?;
        let batch_size = self.config.import_batch_size.max(1);
        let total = prepared.len() as u64;

        let mut outcome = BatchOutcome::default();
        let mut processed = 0u64;
        for batch in prepared.chunks(batch_size) {
            if ctx.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.backup_if_due()?;
            let tx = self.conn.transaction()?;
            for (id, assignments) in batch {
                outcome.applied += update_row(&tx, *id, assignments)?;
            }
            tx.commit()?;
            processed += batch.len() as u64;
            log::debug!("Updated batch of {} ({}/{})", batch.len(), processed, total);
            ctx.report(JobProgress::new("update", processed, total));
        }

        let last = JobProgress::new("update", processed, total);
        ctx.report(if outcome.cancelled { last.cancelled() } else { last.done() });
        Ok(outcome)
    }

    /// Validated (column, stored value) pairs.
    fn assignments(&self, updates: &[FieldUpdate]) -> Result<Vec<(String, String)>> {
        updates
            .iter()
            .map(|u| {
                let field = self.schema.require(&u.data_label)?;
                let value = match field.value_type {
                    ValueType::File | ValueType::RelativePath => u.value.clone(),
                    _ => field.normalize(&u.value)?,
                };
                Ok((u.data_label.clone(), value))
            })
            .collect()
    }

    /// Delete records along with their markers and recognition rows.
    pub fn delete_by_ids(&mut self, ids: &[i64]) -> Result<usize> {
        self.backup_if_due()?;
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let condition = format!("{} IN ({})", ID, vec!["?"; chunk.len()].join(", "));
            let values: Vec<Value> = chunk.iter().map(|id| Value::Integer(*id)).collect();
            deleted += delete_records_where(&tx, &condition, &values)?;
        }
        tx.commit()?;
        self.invalidate_detections_cache();
        log::info!("Deleted {} records", deleted);
        Ok(deleted)
    }

    /// Delete every record whose relative path equals or lies below `prefix`.
    pub fn remove_by_path_prefix(&mut self, prefix: &str) -> Result<usize> {
        self.backup_if_due()?;
        let tx = self.conn.transaction()?;
        let deleted = delete_under_prefix(&tx, prefix)?;
        tx.commit()?;
        self.invalidate_detections_cache();
        log::info!("Removed {} records under '{}'", deleted, prefix);
        Ok(deleted)
    }

    // ----- Duplicates -----

    /// (RelativePath, File) keys held by two or more records.
    pub fn find_duplicate_keys(&self) -> Result<BTreeSet<(String, String)>> {
        let sql = format!(
            "SELECT {rp}, {f} FROM {dt} GROUP BY {rp}, {f} HAVING COUNT(*) > 1",
            rp = quote_ident(RELATIVE_PATH),
            f = quote_ident(FILE),
            dt = DATA_TABLE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| Ok((text_at(row, 0)?, text_at(row, 1)?)))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(keys)
    }

    /// Ids of the records for one key, ascending.
    pub fn ids_for_key(&self, relative_path: &str, file: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2 ORDER BY {}",
            ID,
            DATA_TABLE,
            quote_ident(RELATIVE_PATH),
            quote_ident(FILE),
            ID
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![relative_path, file], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Every key with its ids, ascending.
    pub fn ids_by_key(&self) -> Result<HashMap<(String, String), Vec<i64>>> {
        let mut map: HashMap<(String, String), Vec<i64>> = HashMap::new();
        for (id, relative_path, file) in self.keys()? {
            map.entry((relative_path, file)).or_default().push(id);
        }
        Ok(map)
    }

    fn keys(&self) -> Result<Vec<(i64, String, String)>> {
        let sql = format!(
            "SELECT {}, {}, {} FROM {} ORDER BY {}",
            ID,
            quote_ident(RELATIVE_PATH),
            quote_ident(FILE),
            DATA_TABLE,
            ID
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| Ok((row.get(0)?, text_at(row, 1)?, text_at(row, 2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Ids of records whose file `exists` reports missing below `root`.
    pub fn missing_files(&self, root: &Path, exists: impl Fn(&Path) -> bool) -> Result<Vec<i64>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|(_, relative_path, file)| !exists(&absolute_path(root, relative_path, file)))
            .map(|(id, _, _)| id)
            .collect())
    }

    // ----- Schema evolution -----

    pub fn add_field(&mut self, field: FieldDescriptor) -> Result<FieldDescriptor> {
        self.evolve_schema(|conn, store, schema| add_field_in(conn, store, schema, field))
    }

    /// Drop a field, its column and (for counters) its marker column.
    pub fn remove_field(&mut self, data_label: &str) -> Result<FieldDescriptor> {
        self.evolve_schema(|conn, store, schema| remove_field_in(conn, store, schema, data_label))
    }

    pub fn rename_field(&mut self, from: &str, to: &str) -> Result<()> {
        self.evolve_schema(|conn, store, schema| rename_field_in(conn, store, schema, from, to))
    }

    /// Replace display attributes only; the stored column is untouched.
    pub fn update_field(&mut self, field: &FieldDescriptor) -> Result<()> {
        self.evolve_schema(|conn, store, schema| store.update_field(conn, schema, field))
    }

    /// Run `f` against a working copy of the template inside one
    /// transaction; the copy replaces the template only after commit.
    pub(crate) fn evolve_schema<T>(
        &mut self,
        f: impl FnOnce(&Connection, &SchemaStore, &mut SchemaDefinition) -> Result<T>,
    ) -> Result<T> {
        self.backup_if_due()?;
        let mut working = self.schema.clone();
        let store = self.schema_store;
        let tx = self.conn.transaction()?;
        let out = f(&tx, &store, &mut working)?;
        tx.commit()?;
        self.schema = working;
        Ok(out)
    }
}

fn initialize(conn: &Connection, template: &SchemaDefinition, root_folder: &str) -> Result<()> {
    if !template.has_standard_fields() {
        return Err(StoreError::SchemaMismatch(
            "image template lacks the standard fields".to_string(),
        ));
    }
    let tx = conn.unchecked_transaction()?;
    SchemaStore::image().save(&tx, template)?;
    create_data_tables(&tx, template)?;
    image_set::insert_default_row(&tx, root_folder)?;
    tx.commit()?;
    Ok(())
}

/// Text form of any SQLite value; NULL becomes empty.
pub(crate) fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

fn text_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<String> {
    Ok(value_text(row.get_ref(index)?))
}

/// SQL string literal with embedded quotes doubled.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"Label" TYPE DEFAULT 'value'` for a DataTable or level table column.
pub(crate) fn column_definition(field: &FieldDescriptor) -> String {
    format!(
        "{} {} DEFAULT {}",
        quote_ident(&field.data_label),
        field.value_type.column_type(),
        sql_literal(&field.default_value)
    )
}

/// DataTable (and MarkersTable) shaped by `schema`.
pub(crate) fn create_data_tables(conn: &Connection, schema: &SchemaDefinition) -> Result<()> {
    let columns = schema.fields().iter().map(column_definition).collect::<Vec<_>>();
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({} INTEGER PRIMARY KEY, {});
         CREATE INDEX IF NOT EXISTS idx_datatable_path_file ON {} ({}, {});",
        DATA_TABLE,
        ID,
        columns.join(", "),
        DATA_TABLE,
        quote_ident(RELATIVE_PATH),
        quote_ident(FILE)
    ))?;
    markers::create_markers_table(conn, schema)
}

fn update_row(conn: &Connection, id: i64, assignments: &[(String, String)]) -> Result<usize> {
    if assignments.is_empty() {
        let sql = format!("SELECT {} FROM {} WHERE {} = ?1", ID, DATA_TABLE, ID);
        let found: Option<i64> = conn.query_row(&sql, params![id], |row| row.get(0)).optional()?;
        return Ok(usize::from(found.is_some()));
    }
    let set = assignments
        .iter()
        .enumerate()
        .map(|(i, (label, _))| format!("{} = ?{}", quote_ident(label), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        DATA_TABLE,
        set,
        ID,
        assignments.len() + 1
    );
    let mut values: Vec<Box<dyn ToSql>> = assignments
        .iter()
        .map(|(_, value)| Box::new(value.clone()) as Box<dyn ToSql>)
        .collect();
    values.push(Box::new(id));
    let refs: Vec<&dyn ToSql> = values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(refs.as_slice())?)
}

/// Delete the DataTable rows matching `condition` (over DataTable columns)
/// together with the marker and recognition rows sharing their ids.
pub(crate) fn delete_records_where(conn: &Connection, condition: &str, values: &[Value]) -> Result<usize> {
    let ids = format!("SELECT {} FROM {} WHERE {}", ID, DATA_TABLE, condition);
    for table in [MARKERS_TABLE, DETECTIONS_TABLE, CLASSIFICATIONS_TABLE] {
        if table_exists(conn, table)? {
            conn.execute(
                &format!("DELETE FROM {} WHERE {} IN ({})", table, ID, ids),
                params_from_iter(values.iter()),
            )?;
        }
    }
    Ok(conn.execute(
        &format!("DELETE FROM {} WHERE {}", DATA_TABLE, condition),
        params_from_iter(values.iter()),
    )?)
}

pub(crate) fn delete_under_prefix(conn: &Connection, prefix: &str) -> Result<usize> {
    let condition = sql_under_prefix(&quote_ident(RELATIVE_PATH), 1);
    delete_records_where(conn, &condition, &[Value::Text(prefix.to_string())])
}

pub(crate) fn add_field_in(
    conn: &Connection,
    store: &SchemaStore,
    schema: &mut SchemaDefinition,
    field: FieldDescriptor,
) -> Result<FieldDescriptor> {
    let added = store.add_field(conn, schema, field)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {}",
        DATA_TABLE,
        column_definition(&added)
    ))?;
    if added.value_type == ValueType::Counter {
        markers::add_counter_column(conn, &added.data_label)?;
    }
    log::debug!("Added field {} ({})", added.data_label, added.value_type);
    Ok(added)
}

pub(crate) fn remove_field_in(
    conn: &Connection,
    store: &SchemaStore,
    schema: &mut SchemaDefinition,
    data_label: &str,
) -> Result<FieldDescriptor> {
    let removed = store.remove_field(conn, schema, data_label)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        DATA_TABLE,
        quote_ident(data_label)
    ))?;
    if removed.value_type == ValueType::Counter {
        let remaining: Vec<String> = schema.counters().map(|f| f.data_label.clone()).collect();
        markers::drop_counter_column(conn, data_label, &remaining)?;
    }
    log::debug!("Removed field {}", data_label);
    Ok(removed)
}

pub(crate) fn rename_field_in(
    conn: &Connection,
    store: &SchemaStore,
    schema: &mut SchemaDefinition,
    from: &str,
    to: &str,
) -> Result<()> {
    let is_counter = schema.require(from)?.value_type == ValueType::Counter;
    store.rename_field(conn, schema, from, to)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        DATA_TABLE,
        quote_ident(from),
        quote_ident(to)
    ))?;
    if is_counter {
        markers::rename_counter_column(conn, from, to)?;
    }
    log::debug!("Renamed field {} to {}", from, to);
    Ok(())
}
