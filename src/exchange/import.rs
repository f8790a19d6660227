// CSV import
// Rows update existing records matched on (RelativePath, File); nothing is
// inserted. The whole file is validated before the first write.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::constants::*;
use crate::datetime::{combine_date_time, format_date_time, normalize_date_time};
use crate::error::{Diagnostic, Result, StoreError};
use crate::jobs::JobContext;
use crate::paths::normalize_relative_path;
use crate::records::{RecordStore, RecordUpdate};
use crate::schema::definition::{SchemaDefinition, ValueType};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub rows_read: usize,
    pub updated: usize,
    pub cancelled: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// One data row after header validation.
#[derive(Debug, Clone)]
struct ImportRow {
    relative_path: String,
    file: String,
    cells: Vec<String>,
}

/// Column roles resolved from the header.
struct Columns {
    names: Vec<String>,
    file: usize,
    relative_path: usize,
    date_time: Option<usize>,
    date: Option<usize>,
    time: Option<usize>,
}

impl Columns {
    fn resolve(header: &[String], schema: &SchemaDefinition) -> Result<Self> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for name in header {
            if !seen.insert(name.as_str()) {
                problems.push(format!("column '{}' appears more than once", name));
            } else if !schema.contains(name) && !TOLERATED_CSV_HEADERS.contains(&name.as_str()) {
                problems.push(format!("'{}' is not a field of this store", name));
            }
        }
        let position = |label: &str| header.iter().position(|h| h == label);
        let file = position(FILE);
        let relative_path = position(RELATIVE_PATH);
        if file.is_none() {
            problems.push(format!("the required column '{}' is missing", FILE));
        }
        if relative_path.is_none() {
            problems.push(format!("the required column '{}' is missing", RELATIVE_PATH));
        }
        match (file, relative_path) {
            (Some(file), Some(relative_path)) if problems.is_empty() => Ok(Self {
                names: header.to_vec(),
                file,
                relative_path,
                date_time: position(DATE_TIME),
                date: position(DATE),
                time: position(TIME),
            }),
            _ => Err(StoreError::CsvHeaderInvalid(problems)),
        }
    }

    /// Columns written back to the store as-is.
    fn updatable<'a>(&'a self, schema: &'a SchemaDefinition) -> impl Iterator<Item = (usize, &'a str)> + 'a {
        self.names.iter().enumerate().filter_map(move |(i, name)| {
            let field = schema.get(name)?;
            match field.value_type {
                ValueType::File | ValueType::RelativePath | ValueType::DateTime => None,
                _ => Some((i, name.as_str())),
            }
        })
    }

    fn has_date_time(&self) -> bool {
        self.date_time.is_some() || (self.date.is_some() && self.time.is_some())
    }

    /// Stored DateTime for a row, None when the cells do not parse.
    fn date_time_of(&self, cells: &[String]) -> Option<String> {
        if let Some(i) = self.date_time {
            return normalize_date_time(&cells[i]);
        }
        match (self.date, self.time) {
            (Some(d), Some(t)) => combine_date_time(&cells[d], &cells[t]).map(|dt| format_date_time(&dt)),
            _ => None,
        }
    }
}

/// Parse the file into a trimmed header and raw data rows.
fn parse<R: Read>(reader: R) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(|e| StoreError::StoreUnreadable(format!("CSV: {}", e)))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    if rows.len() < 2 {
        return Err(StoreError::CsvHeaderInvalid(vec![
            "the file needs a header row and at least one data row".to_string(),
        ]));
    }
    let header = rows
        .remove(0)
        .into_iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    Ok((header, rows))
}

/// Check every cell; report at most `max_reported` offending rows.
fn validate(rows: &[Vec<String>], columns: &Columns, schema: &SchemaDefinition, max_reported: usize) -> Result<()> {
    let mut problems = Vec::new();
    let mut bad_rows = 0;
    for (index, cells) in rows.iter().enumerate() {
        let line = index + 2;
        let mut row_problems = Vec::new();
        if cells.len() != columns.names.len() {
            row_problems.push(format!(
                "row {}: expected {} values but found {}",
                line,
                columns.names.len(),
                cells.len()
            ));
        } else {
            for (i, label) in columns.updatable(schema) {
                let field = schema.require(label)?;
                if !field.accepts(&cells[i]) {
                    row_problems.push(format!("row {}: '{}' is not a valid {}", line, cells[i], label));
                }
            }
        }
        if !row_problems.is_empty() {
            bad_rows += 1;
            problems.extend(row_problems);
            if bad_rows >= max_reported.max(1) {
                break;
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(StoreError::CsvValueInvalid(problems))
    }
}

/// Pair CSV rows with stored records key by key, both sides in encounter
/// order. Unequal group sizes pair the shorter side and are reported, a
/// single row against stored duplicates included.
fn reconcile(
    mut rows: Vec<ImportRow>,
    stored: &HashMap<(String, String), Vec<i64>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<(i64, ImportRow)> {
    rows.sort_by(|a, b| (&a.relative_path, &a.file).cmp(&(&b.relative_path, &b.file)));
    let mut pairs = Vec::with_capacity(rows.len());
    let mut rows = rows.into_iter().peekable();
    while let Some(first) = rows.next() {
        let key = (first.relative_path.clone(), first.file.clone());
        let mut group = vec![first];
        while let Some(next) = rows.next_if(|r| r.relative_path == key.0 && r.file == key.1) {
            group.push(next);
        }
        let Some(ids) = stored.get(&key) else {
            continue;
        };
        if group.len() != ids.len() {
            let diagnostic = Diagnostic::DuplicateCountMismatch {
                relative_path: key.0.clone(),
                file: key.1.clone(),
                stored: ids.len(),
                imported: group.len(),
            };
            log::warn!("{}", diagnostic);
            diagnostics.push(diagnostic);
        }
        pairs.extend(ids.iter().copied().zip(group));
    }
    pairs
}

/// Import CSV text from `reader` into `store`.
pub fn read_csv<R: Read>(store: &mut RecordStore, reader: R, ctx: &mut JobContext<'_>) -> Result<ImportOutcome> {
    let (header, raw_rows) = parse(reader)?;
    let schema = store.schema().clone();
    let columns = Columns::resolve(&header, &schema)?;
    validate(&raw_rows, &columns, &schema, store.config().max_reported_error_rows)?;

    let mut outcome = ImportOutcome {
        rows_read: raw_rows.len(),
        ..ImportOutcome::default()
    };
    let rows = raw_rows
        .into_iter()
        .map(|cells| ImportRow {
            relative_path: normalize_relative_path(cells[columns.relative_path].trim()),
            file: cells[columns.file].trim().to_string(),
            cells,
        })
        .collect::<Vec<_>>();
    let pairs = reconcile(rows, &store.ids_by_key()?, &mut outcome.diagnostics);

    let date_field = schema.fields().iter().any(|f| f.value_type == ValueType::DateTime);
    let mut date_time_skipped = 0;
    let updates = pairs
        .iter()
        .map(|(id, row)| {
            let mut update = RecordUpdate::new(*id);
            for (i, label) in columns.updatable(&schema) {
                update = update.set(label, row.cells[i].clone());
            }
            if date_field && columns.has_date_time() {
                match columns.date_time_of(&row.cells) {
                    Some(stored) => update = update.set(DATE_TIME, stored),
                    None => date_time_skipped += 1,
                }
            }
            update
        })
        .collect::<Vec<_>>();
    if date_time_skipped > 0 {
        let diagnostic = Diagnostic::DateTimeNotUpdated {
            skipped: date_time_skipped,
            total: pairs.len(),
        };
        log::warn!("{}", diagnostic);
        outcome.diagnostics.push(diagnostic);
    }

    let applied = store.bulk_update(&updates, ctx)?;
    outcome.updated = applied.applied;
    outcome.cancelled = applied.cancelled;
    log::info!(
        "Imported {} CSV rows: {} records updated{}",
        outcome.rows_read,
        outcome.updated,
        if outcome.cancelled { " before cancellation" } else { "" }
    );
    Ok(outcome)
}

pub fn import_csv(store: &mut RecordStore, path: &Path, ctx: &mut JobContext<'_>) -> Result<ImportOutcome> {
    let file = std::fs::File::open(path)
        .map_err(|e| StoreError::StoreUnreadable(format!("{}: {}", path.display(), e)))?;
    read_csv(store, file, ctx)
}
