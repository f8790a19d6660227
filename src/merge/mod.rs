// Merge and checkout
// Merge folds a source store into a destination under a relative-path
// prefix; checkout cuts the records under a prefix out into a new store.

pub mod checkout;


use std::path::Path;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::constants::*;
use crate::db::{self, level_table_name, max_value, qualified, quote_ident, row_count, table_exists_in, ATTACHED};
use crate::error::{Diagnostic, Result, StoreError};
use crate::jobs::{JobContext, JobProgress};
use crate::levels::{load_levels, load_levels_from, LevelDescriptor};
use crate::paths::{normalize_relative_path, path_depth, sql_prefix_expr, sql_under_prefix};
use crate::recognition::{
    create_tables, drop_tables_if_empty, load_categories_from, load_info_from, merge_categories, save_categories,
    save_info, tables_exist_in,
};
use crate::records::{delete_under_prefix, RecordStore};
use crate::schema::definition::SchemaDefinition;
use crate::schema::store::SchemaStore;

pub use checkout::{checkout, CheckoutReport};

const MERGE_PHASES: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Folder, relative to the destination root, that the source root maps to.
    pub prefix: String,
    /// Check-in: drop what the destination holds under the prefix first.
    pub replace_existing: bool,
}

impl MergeOptions {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: normalize_relative_path(prefix),
            replace_existing: false,
        }
    }

    pub fn check_in(prefix: &str) -> Self {
        Self {
            replace_existing: true,
            ..Self::new(prefix)
        }
    }

    /// Leading destination levels that the prefix already accounts for.
    pub fn levels_to_ignore(&self) -> usize {
        path_depth(&self.prefix)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub files_merged: usize,
    pub files_replaced: usize,
    pub markers_merged: usize,
    pub detections_merged: usize,
    pub classifications_merged: usize,
    pub level_rows_merged: usize,
    /// Source level rows skipped because the destination already had the folder.
    pub level_rows_kept: usize,
    pub cancelled: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Check that `source` can be merged into `destination` under `prefix`.
/// Nothing is written; the first incompatibility is returned.
pub fn check_merge_compatibility(
    destination: &SchemaDefinition,
    destination_levels: &[LevelDescriptor],
    source: &SchemaDefinition,
    source_levels: &[LevelDescriptor],
    prefix: &str,
) -> Result<()> {
    for field in source.fields() {
        let Some(resident) = destination.get(&field.data_label) else {
            return Err(StoreError::SchemaMismatch(format!(
                "the destination has no field '{}'",
                field.data_label
            )));
        };
        if resident.value_type != field.value_type {
            return Err(StoreError::SchemaTypeConflict {
                label: field.data_label.clone(),
                expected: resident.value_type.to_string(),
                found: field.value_type.to_string(),
            });
        }
    }

    if source_levels.is_empty() {
        return Ok(());
    }
    let ignore = path_depth(prefix);
    if destination_levels.len() < ignore || destination_levels.len() - ignore != source_levels.len() {
        return Err(StoreError::MetadataLevelMismatch(format!(
            "the source has {} folder levels but the destination has {} below '{}'",
            source_levels.len(),
            destination_levels.len().saturating_sub(ignore),
            prefix
        )));
    }
    for (theirs, ours) in source_levels.iter().zip(&destination_levels[ignore..]) {
        if !theirs.matches(ours) {
            return Err(StoreError::MetadataLevelMismatch(format!(
                "source level {} ({}) does not match destination level {} ({})",
                theirs.level,
                theirs.name(),
                ours.level,
                ours.name()
            )));
        }
        let mut their_labels = theirs.schema.data_labels();
        let mut our_labels = ours.schema.data_labels();
        their_labels.sort_unstable();
        our_labels.sort_unstable();
        if their_labels != our_labels {
            return Err(StoreError::MetadataLevelMismatch(format!(
                "level {} ({}) has different fields in the two stores",
                ours.level,
                ours.name()
            )));
        }
    }
    Ok(())
}

/// Merge the store at `source_path` into `destination`, all or nothing.
/// A cancelled merge rolls back and reports `cancelled`.
pub fn merge(
    destination: &mut RecordStore,
    source_path: &Path,
    options: &MergeOptions,
    ctx: &mut JobContext<'_>,
) -> Result<MergeReport> {
    if !source_path.is_file() {
        return Err(StoreError::StoreUnreadable(format!(
            "{} does not exist",
            source_path.display()
        )));
    }
    if let Some(own) = destination.path() {
        if own.canonicalize().ok() == source_path.canonicalize().ok() {
            return Err(StoreError::StoreUnreadable(
                "a store cannot be merged into itself".to_string(),
            ));
        }
    }

    destination.backup_if_due()?;
    db::attach(destination.conn(), source_path)
        .map_err(|e| StoreError::StoreUnreadable(format!("{}: {}", source_path.display(), e)))?;
    destination.conn().execute_batch("PRAGMA foreign_keys = OFF")?;

    let mut report = MergeReport::default();
    let result = merge_attached(destination, options, ctx, &mut report);

    // Runs after the transaction has been committed or dropped.
    let restored = destination
        .conn()
        .execute_batch("PRAGMA foreign_keys = ON")
        .map_err(StoreError::from)
        .and_then(|_| db::detach(destination.conn()));
    destination.invalidate_detections_cache();

    match result {
        Ok(()) => {
            restored?;
            if drop_tables_if_empty(destination.conn())? {
                report
                    .diagnostics
                    .push(Diagnostic::Note("no detections remain; recognition tables removed".to_string()));
            }
            ctx.report(JobProgress::new("merge", MERGE_PHASES, MERGE_PHASES).done());
            log::info!(
                "Merged {} files from {} under '{}'",
                report.files_merged,
                source_path.display(),
                options.prefix
            );
            Ok(report)
        }
        Err(StoreError::Cancelled) => {
            restored?;
            ctx.report(JobProgress::new("merge", 0, MERGE_PHASES).cancelled());
            log::info!("Merge of {} cancelled; nothing was written", source_path.display());
            Ok(MergeReport {
                cancelled: true,
                ..MergeReport::default()
            })
        }
        Err(e) => {
            if let Err(detach_error) = restored {
                log::warn!("Could not detach {}: {}", source_path.display(), detach_error);
            }
            log::warn!("Merge of {} failed: {}", source_path.display(), e);
            Err(e)
        }
    }
}

fn merge_attached(
    destination: &mut RecordStore,
    options: &MergeOptions,
    ctx: &mut JobContext<'_>,
    report: &mut MergeReport,
) -> Result<()> {
    let conn = destination.conn();
    for table in [TEMPLATE_TABLE, DATA_TABLE] {
        let present =
            table_exists_in(conn, ATTACHED, table).map_err(|e| StoreError::StoreUnreadable(format!("source store: {}", e)))?;
        if !present {
            return Err(StoreError::StoreCorrupt(format!("the source store has no {} table", table)));
        }
    }
    let source_schema = SchemaStore::image().load_from(conn, ATTACHED)?;
    let source_levels = load_levels_from(conn, ATTACHED)?;
    let destination_levels = load_levels(conn)?;
    check_merge_compatibility(
        destination.schema(),
        &destination_levels,
        &source_schema,
        &source_levels,
        &options.prefix,
    )?;
    ctx.checkpoint()?;

    let ignore = options.levels_to_ignore() as i64;
    let tx = destination.conn_mut().transaction()?;

    if options.replace_existing {
        report.files_replaced = delete_under_prefix(&tx, &options.prefix)?;
        for level in destination_levels.iter().filter(|l| l.level > ignore) {
            remove_level_rows_under(&tx, level.level, &options.prefix)?;
        }
        log::debug!("Check-in removed {} files under '{}'", report.files_replaced, options.prefix);
    }
    ctx.report(JobProgress::new("merge", 1, MERGE_PHASES));
    ctx.checkpoint()?;

    let id_offset = max_value(&tx, "main", DATA_TABLE, ID)?;
    report.files_merged = copy_records(&tx, &source_schema, id_offset, &options.prefix)?;
    report.markers_merged = copy_markers(&tx, &source_schema, id_offset)?;
    ctx.report(JobProgress::new("merge", 2, MERGE_PHASES).with_message(format!("{} files copied", report.files_merged)));
    ctx.checkpoint()?;

    let (detections, classifications) = merge_recognition(&tx, id_offset)?;
    report.detections_merged = detections;
    report.classifications_merged = classifications;
    ctx.report(JobProgress::new("merge", 3, MERGE_PHASES));
    ctx.checkpoint()?;

    for level in &source_levels {
        let (merged, kept) = copy_level_rows(&tx, level, level.level + ignore, &options.prefix)?;
        report.level_rows_merged += merged;
        report.level_rows_kept += kept;
    }
    ctx.checkpoint()?;

    ctx.report(JobProgress::new("merge", 4, MERGE_PHASES).with_message("committing").not_cancellable());
    tx.commit()?;
    Ok(())
}

fn remove_level_rows_under(conn: &Connection, level: i64, prefix: &str) -> Result<usize> {
    let table = level_table_name(level);
    if !table_exists_in(conn, "main", &table)? {
        return Ok(0);
    }
    Ok(conn.execute(
        &format!(
            "DELETE FROM {} WHERE {}",
            qualified("main", &table),
            sql_under_prefix(FOLDER_DATA_PATH, 1)
        ),
        params![prefix],
    )?)
}

fn copy_records(conn: &Connection, source: &SchemaDefinition, id_offset: i64, prefix: &str) -> Result<usize> {
    let columns = source
        .fields()
        .iter()
        .map(|f| quote_ident(&f.data_label))
        .collect::<Vec<_>>();
    let selected = source
        .fields()
        .iter()
        .map(|f| {
            let column = quote_ident(&f.data_label);
            if f.data_label == RELATIVE_PATH {
                sql_prefix_expr(&column, 2)
            } else {
                column
            }
        })
        .collect::<Vec<_>>();
    let sql = format!(
        "INSERT INTO {} ({}, {}) SELECT {} + ?1, {} FROM {} ORDER BY {}",
        qualified("main", DATA_TABLE),
        ID,
        columns.join(", "),
        ID,
        selected.join(", "),
        qualified(ATTACHED, DATA_TABLE),
        ID
    );
    Ok(conn.execute(&sql, params![id_offset, prefix])?)
}

fn copy_markers(conn: &Connection, source: &SchemaDefinition, id_offset: i64) -> Result<usize> {
    let counters = source
        .counters()
        .map(|f| quote_ident(&f.data_label))
        .collect::<Vec<_>>();
    if counters.is_empty() || !table_exists_in(conn, ATTACHED, MARKERS_TABLE)? {
        return Ok(0);
    }
    let sql = format!(
        "INSERT INTO {} ({id}, {cols}) SELECT {id} + ?1, {cols} FROM {}",
        qualified("main", MARKERS_TABLE),
        qualified(ATTACHED, MARKERS_TABLE),
        id = ID,
        cols = counters.join(", ")
    );
    Ok(conn.execute(&sql, params![id_offset])?)
}

/// Reconcile info and categories, then copy detection and classification
/// rows with their keys shifted past the destination's.
fn merge_recognition(conn: &Connection, id_offset: i64) -> Result<(usize, usize)> {
    if !tables_exist_in(conn, ATTACHED)? {
        return Ok((0, 0));
    }
    let their_info = load_info_from(conn, ATTACHED)?.unwrap_or_default();
    let info = match load_info_from(conn, "main")? {
        Some(ours) => ours.merge_preferring(&their_info),
        None => their_info,
    };
    let detection_categories = merge_categories(
        &load_categories_from(conn, "main", DETECTION_CATEGORIES_TABLE)?,
        &load_categories_from(conn, ATTACHED, DETECTION_CATEGORIES_TABLE)?,
    )?;
    let classification_categories = merge_categories(
        &load_categories_from(conn, "main", CLASSIFICATION_CATEGORIES_TABLE)?,
        &load_categories_from(conn, ATTACHED, CLASSIFICATION_CATEGORIES_TABLE)?,
    )?;

    create_tables(conn)?;
    save_info(conn, &info)?;
    save_categories(conn, DETECTION_CATEGORIES_TABLE, &detection_categories)?;
    save_categories(conn, CLASSIFICATION_CATEGORIES_TABLE, &classification_categories)?;

    let detection_offset = max_value(conn, "main", DETECTIONS_TABLE, DETECTION_ID)?;
    let detections = conn.execute(
        &format!(
            "INSERT INTO {} ({key}, {cat}, {conf}, {bbox}, {id}) \
             SELECT {key} + ?1, {cat}, {conf}, {bbox}, {id} + ?2 FROM {}",
            qualified("main", DETECTIONS_TABLE),
            qualified(ATTACHED, DETECTIONS_TABLE),
            key = DETECTION_ID,
            cat = CATEGORY,
            conf = CONF,
            bbox = BBOX,
            id = ID
        ),
        params![detection_offset, id_offset],
    )?;

    let classifications = if table_exists_in(conn, ATTACHED, CLASSIFICATIONS_TABLE)? {
        let classification_offset = max_value(conn, "main", CLASSIFICATIONS_TABLE, CLASSIFICATION_ID)?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({key}, {cat}, {conf}, {id}) \
                 SELECT {key} + ?1, {cat}, {conf}, {id} + ?2 FROM {}",
                qualified("main", CLASSIFICATIONS_TABLE),
                qualified(ATTACHED, CLASSIFICATIONS_TABLE),
                key = CLASSIFICATION_ID,
                cat = CATEGORY,
                conf = CONF,
                id = ID
            ),
            params![classification_offset, id_offset],
        )?
    } else {
        0
    };
    log::debug!("Merged {} detections, {} classifications", detections, classifications);
    Ok((detections, classifications))
}

/// Copy one source level into destination level `target`, prefixing folder
/// paths. Folders the destination already describes keep their row.
/// Returns (rows copied, rows skipped).
fn copy_level_rows(conn: &Connection, source: &LevelDescriptor, target: i64, prefix: &str) -> Result<(usize, usize)> {
    let from = level_table_name(source.level);
    let to = level_table_name(target);
    if !table_exists_in(conn, ATTACHED, &from)? {
        return Ok((0, 0));
    }
    let available = row_count(conn, ATTACHED, &from)? as usize;
    let id_offset = max_value(conn, "main", &to, ID)?;
    let columns = source
        .schema
        .fields()
        .iter()
        .map(|f| quote_ident(&f.data_label))
        .collect::<Vec<_>>();
    let insert_columns: String = columns.iter().map(|c| format!(", {}", c)).collect();
    let select_columns: String = columns.iter().map(|c| format!(", s.{}", c)).collect();
    let prefixed = sql_prefix_expr(&format!("s.{}", FOLDER_DATA_PATH), 2);
    let sql = format!(
        "INSERT INTO {to} ({id}, {path}{ins}) \
         SELECT s.{id} + ?1, {prefixed}{sel} FROM {from} AS s \
         WHERE NOT EXISTS (SELECT 1 FROM {to} AS d WHERE d.{path} = {prefixed}) \
         ORDER BY s.{id}",
        to = qualified("main", &to),
        from = qualified(ATTACHED, &from),
        id = ID,
        path = FOLDER_DATA_PATH,
        ins = insert_columns,
        sel = select_columns,
        prefixed = prefixed
    );
    let copied = conn.execute(&sql, params![id_offset, prefix])?;
    log::debug!("Level {} -> {}: copied {}, kept {}", source.level, target, copied, available - copied);
    Ok((copied, available - copied))
}
