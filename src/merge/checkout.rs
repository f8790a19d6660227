// Checkout: copy the records under a folder into a new store

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::constants::*;
use crate::db::{self, level_table_name, qualified, quote_ident, table_exists_in, ATTACHED};
use crate::error::{Result, StoreError};
use crate::jobs::{JobContext, JobProgress};
use crate::levels::{create_level_in, LevelDescriptor};
use crate::paths::{normalize_relative_path, path_depth, sql_strip_expr, sql_under_prefix};
use crate::recognition::{create_tables, drop_tables_if_empty, save_categories, save_info, tables_exist_in};
use crate::records::{image_set, RecordStore};
use crate::schema::definition::SchemaDefinition;

const CHECKOUT_PHASES: u64 = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutReport {
    pub path: PathBuf,
    pub files: usize,
    pub markers: usize,
    pub detections: usize,
    pub classifications: usize,
    pub level_rows: usize,
    pub cancelled: bool,
}

/// Create `destination_path` holding the records of `source` at or below
/// `prefix`, with the prefix trimmed off their relative paths. Record ids
/// are kept. On failure or cancellation the new file is removed.
pub fn checkout(
    source: &RecordStore,
    destination_path: &Path,
    prefix: &str,
    ctx: &mut JobContext<'_>,
) -> Result<CheckoutReport> {
    let prefix = normalize_relative_path(prefix);
    if destination_path.exists() {
        return Err(StoreError::StoreUnreadable(format!(
            "{} already exists",
            destination_path.display()
        )));
    }

    let result = prepare_destination(source, destination_path, &prefix)
        .and_then(|_| copy_under_prefix(source, destination_path, &prefix, ctx));
    match result {
        Ok(mut report) => {
            let out = RecordStore::open(destination_path, source.config().clone())?;
            drop_tables_if_empty(out.conn())?;
            report.path = destination_path.to_path_buf();
            ctx.report(JobProgress::new("checkout", CHECKOUT_PHASES, CHECKOUT_PHASES).done());
            log::info!(
                "Checked out {} files under '{}' to {}",
                report.files,
                prefix,
                destination_path.display()
            );
            Ok(report)
        }
        Err(e) => {
            if let Err(remove_error) = std::fs::remove_file(destination_path) {
                log::warn!("Could not remove {}: {}", destination_path.display(), remove_error);
            }
            if matches!(e, StoreError::Cancelled) {
                ctx.report(JobProgress::new("checkout", 0, CHECKOUT_PHASES).cancelled());
                log::info!("Checkout to {} cancelled", destination_path.display());
                return Ok(CheckoutReport {
                    cancelled: true,
                    ..CheckoutReport::default()
                });
            }
            Err(e)
        }
    }
}

/// New store with the source template, the levels below the prefix
/// renumbered from 1, recognition metadata and view settings.
fn prepare_destination(source: &RecordStore, destination_path: &Path, prefix: &str) -> Result<()> {
    let depth = path_depth(prefix) as i64;
    let levels = source.levels()?;
    let settings = source.image_set()?;
    let recognition = if tables_exist_in(source.conn(), "main")? {
        Some((
            source.recognition_info()?.unwrap_or_default(),
            source.detection_categories()?,
            source.classification_categories()?,
        ))
    } else {
        None
    };

    let out = RecordStore::create(destination_path, source.schema(), source.config().clone())?;
    let tx = out.conn().unchecked_transaction()?;
    for level in levels.iter().filter(|l| l.level > depth) {
        create_level_in(
            &tx,
            &LevelDescriptor {
                level: level.level - depth,
                ..level.clone()
            },
        )?;
    }
    if let Some((info, detection_categories, classification_categories)) = &recognition {
        create_tables(&tx)?;
        save_info(&tx, info)?;
        save_categories(&tx, DETECTION_CATEGORIES_TABLE, detection_categories)?;
        save_categories(&tx, CLASSIFICATION_CATEGORIES_TABLE, classification_categories)?;
    }
    let mut out_settings = image_set::load(&tx)?;
    out_settings.quick_paste_terms = settings.quick_paste_terms;
    out_settings.bb_display_threshold = settings.bb_display_threshold;
    image_set::save(&tx, &out_settings)?;
    tx.commit()?;
    Ok(())
}

fn copy_under_prefix(
    source: &RecordStore,
    destination_path: &Path,
    prefix: &str,
    ctx: &mut JobContext<'_>,
) -> Result<CheckoutReport> {
    let levels = source.levels()?;
    let conn = source.conn();
    db::attach(conn, destination_path)?;
    let result = copy_attached(conn, source.schema(), &levels, prefix, ctx);
    let detached = db::detach(conn);
    let report = result?;
    detached?;
    Ok(report)
}

fn copy_attached(
    conn: &Connection,
    schema: &SchemaDefinition,
    levels: &[LevelDescriptor],
    prefix: &str,
    ctx: &mut JobContext<'_>,
) -> Result<CheckoutReport> {
    let mut report = CheckoutReport::default();
    let tx = conn.unchecked_transaction()?;

    let columns = schema
        .fields()
        .iter()
        .map(|f| quote_ident(&f.data_label))
        .collect::<Vec<_>>();
    let selected = schema
        .fields()
        .iter()
        .map(|f| {
            let column = quote_ident(&f.data_label);
            if f.data_label == RELATIVE_PATH {
                sql_strip_expr(&column, 1)
            } else {
                column
            }
        })
        .collect::<Vec<_>>();
    report.files = tx.execute(
        &format!(
            "INSERT INTO {} ({id}, {}) SELECT {id}, {} FROM {} WHERE {} ORDER BY {id}",
            qualified(ATTACHED, DATA_TABLE),
            columns.join(", "),
            selected.join(", "),
            qualified("main", DATA_TABLE),
            sql_under_prefix(&quote_ident(RELATIVE_PATH), 1),
            id = ID
        ),
        params![prefix],
    )?;
    ctx.report(JobProgress::new("checkout", 1, CHECKOUT_PHASES));
    ctx.checkpoint()?;

    let copied_ids = format!("SELECT {} FROM {}", ID, qualified(ATTACHED, DATA_TABLE));
    let counters = schema.counters().map(|f| quote_ident(&f.data_label)).collect::<Vec<_>>();
    if !counters.is_empty() && table_exists_in(&tx, "main", MARKERS_TABLE)? {
        report.markers = tx.execute(
            &format!(
                "INSERT INTO {} ({id}, {cols}) SELECT {id}, {cols} FROM {} WHERE {id} IN ({})",
                qualified(ATTACHED, MARKERS_TABLE),
                qualified("main", MARKERS_TABLE),
                copied_ids,
                id = ID,
                cols = counters.join(", ")
            ),
            [],
        )?;
    }

    if tables_exist_in(&tx, "main")? {
        report.detections = tx.execute(
            &format!(
                "INSERT INTO {} ({key}, {cat}, {conf}, {bbox}, {id}) \
                 SELECT {key}, {cat}, {conf}, {bbox}, {id} FROM {} WHERE {id} IN ({})",
                qualified(ATTACHED, DETECTIONS_TABLE),
                qualified("main", DETECTIONS_TABLE),
                copied_ids,
                key = DETECTION_ID,
                cat = CATEGORY,
                conf = CONF,
                bbox = BBOX,
                id = ID
            ),
            [],
        )?;
        if table_exists_in(&tx, "main", CLASSIFICATIONS_TABLE)? {
            report.classifications = tx.execute(
                &format!(
                    "INSERT INTO {} ({key}, {cat}, {conf}, {id}) \
                     SELECT {key}, {cat}, {conf}, {id} FROM {} WHERE {id} IN ({})",
                    qualified(ATTACHED, CLASSIFICATIONS_TABLE),
                    qualified("main", CLASSIFICATIONS_TABLE),
                    copied_ids,
                    key = CLASSIFICATION_ID,
                    cat = CATEGORY,
                    conf = CONF,
                    id = ID
                ),
                [],
            )?;
        }
    }
    ctx.report(JobProgress::new("checkout", 2, CHECKOUT_PHASES));
    ctx.checkpoint()?;

    let depth = path_depth(prefix) as i64;
    for level in levels.iter().filter(|l| l.level > depth) {
        let from = level_table_name(level.level);
        if !table_exists_in(&tx, "main", &from)? {
            continue;
        }
        let fields: String = level
            .schema
            .fields()
            .iter()
            .map(|f| format!(", {}", quote_ident(&f.data_label)))
            .collect();
        report.level_rows += tx.execute(
            &format!(
                "INSERT INTO {} ({id}, {path}{fields}) SELECT {id}, {}{fields} FROM {} \
                 WHERE {} AND (?1 = '' OR {path} <> ?1) ORDER BY {id}",
                qualified(ATTACHED, &level_table_name(level.level - depth)),
                sql_strip_expr(FOLDER_DATA_PATH, 1),
                qualified("main", &from),
                sql_under_prefix(FOLDER_DATA_PATH, 1),
                id = ID,
                path = FOLDER_DATA_PATH,
                fields = fields
            ),
            params![prefix],
        )?;
    }
    ctx.report(JobProgress::new("checkout", 3, CHECKOUT_PHASES));
    ctx.checkpoint()?;

    tx.commit()?;
    Ok(report)
}
