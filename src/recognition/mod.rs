// Recognition tables
// Detector and classifier output attached to records: the Info singleton,
// two category dictionaries, and one row per detection / classification.
// The tables exist only while the store holds at least one detection.

pub mod source;

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::db::{row_count, table_exists, table_exists_in};
use crate::error::{Result, StoreError};
use crate::records::RecordStore;

pub use source::{PopulateOutcome, RecognitionSource};

pub const RECOGNITION_TABLES: [&str; 5] = [
    CLASSIFICATIONS_TABLE,
    DETECTIONS_TABLE,
    CLASSIFICATION_CATEGORIES_TABLE,
    DETECTION_CATEGORIES_TABLE,
    INFO_TABLE,
];

/// The singleton Info row. Unknown values use the documented markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionInfo {
    pub detector: String,
    pub detector_version: String,
    pub detection_completion_time: String,
    pub classifier: String,
    pub classification_completion_time: String,
    pub typical_detection_threshold: f64,
    pub conservative_detection_threshold: f64,
    pub typical_classification_threshold: f64,
}

impl Default for RecognitionInfo {
    fn default() -> Self {
        Self {
            detector: DETECTOR_UNKNOWN.to_string(),
            detector_version: DETECTOR_VERSION_UNKNOWN.to_string(),
            detection_completion_time: COMPLETION_TIME_UNKNOWN.to_string(),
            classifier: CLASSIFIER_UNKNOWN.to_string(),
            classification_completion_time: COMPLETION_TIME_UNKNOWN.to_string(),
            typical_detection_threshold: DEFAULT_TYPICAL_DETECTION_THRESHOLD,
            conservative_detection_threshold: DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD,
            typical_classification_threshold: DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD,
        }
    }
}

fn pick_text(mine: &str, theirs: &str, unknown: &str) -> String {
    let is_unknown = |v: &str| v.trim().is_empty() || v == unknown;
    if is_unknown(mine) && !is_unknown(theirs) {
        theirs.to_string()
    } else {
        mine.to_string()
    }
}

fn pick_number(mine: f64, theirs: f64, default: f64) -> f64 {
    if mine == default && theirs != default {
        theirs
    } else {
        mine
    }
}

impl RecognitionInfo {
    /// Per value: keep ours unless it is unknown/default and theirs is not.
    pub fn merge_preferring(&self, theirs: &RecognitionInfo) -> RecognitionInfo {
        RecognitionInfo {
            detector: pick_text(&self.detector, &theirs.detector, DETECTOR_UNKNOWN),
            detector_version: pick_text(&self.detector_version, &theirs.detector_version, DETECTOR_VERSION_UNKNOWN),
            detection_completion_time: pick_text(
                &self.detection_completion_time,
                &theirs.detection_completion_time,
                COMPLETION_TIME_UNKNOWN,
            ),
            classifier: pick_text(&self.classifier, &theirs.classifier, CLASSIFIER_UNKNOWN),
            classification_completion_time: pick_text(
                &self.classification_completion_time,
                &theirs.classification_completion_time,
                COMPLETION_TIME_UNKNOWN,
            ),
            typical_detection_threshold: pick_number(
                self.typical_detection_threshold,
                theirs.typical_detection_threshold,
                DEFAULT_TYPICAL_DETECTION_THRESHOLD,
            ),
            conservative_detection_threshold: pick_number(
                self.conservative_detection_threshold,
                theirs.conservative_detection_threshold,
                DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD,
            ),
            typical_classification_threshold: pick_number(
                self.typical_classification_threshold,
                theirs.typical_classification_threshold,
                DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD,
            ),
        }
    }
}

/// A category code's label; classification categories may carry a description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

impl Category {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: String::new(),
        }
    }
}

pub type CategoryDictionary = BTreeMap<String, Category>;

/// Union of two dictionaries. A code with two different labels is a
/// `CategoryConflict`; descriptions fill in where ours is empty.
pub fn merge_categories(ours: &CategoryDictionary, theirs: &CategoryDictionary) -> Result<CategoryDictionary> {
    let mut merged = ours.clone();
    for (code, incoming) in theirs {
        match merged.get_mut(code) {
            Some(existing) if existing.label != incoming.label => {
                return Err(StoreError::CategoryConflict {
                    code: code.clone(),
                    existing: existing.label.clone(),
                    incoming: incoming.label.clone(),
                });
            }
            Some(existing) => {
                if existing.description.is_empty() {
                    existing.description = incoming.description.clone();
                }
            }
            None => {
                merged.insert(code.clone(), incoming.clone());
            }
        }
    }
    Ok(merged)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub detection_id: i64,
    pub id: i64,
    pub category: String,
    pub conf: f64,
    pub bbox: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub classification_id: i64,
    pub id: i64,
    pub category: String,
    pub conf: f64,
}

pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Info (
            infoID INTEGER PRIMARY KEY,
            detector TEXT,
            megadetector_version TEXT,
            detection_completion_time TEXT,
            classifier TEXT,
            classification_completion_time TEXT,
            typical_detection_threshold REAL,
            conservative_detection_threshold REAL,
            typical_classification_threshold REAL
        );
        CREATE TABLE IF NOT EXISTS DetectionCategories (
            category TEXT PRIMARY KEY,
            label TEXT
        );
        CREATE TABLE IF NOT EXISTS ClassificationCategories (
            category TEXT PRIMARY KEY,
            label TEXT,
            description TEXT
        );
        CREATE TABLE IF NOT EXISTS Detections (
            detectionID INTEGER PRIMARY KEY,
            category TEXT,
            conf REAL,
            bbox TEXT,
            Id INTEGER,
            FOREIGN KEY (Id) REFERENCES DataTable (Id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS Classifications (
            classificationID INTEGER PRIMARY KEY,
            category TEXT,
            conf REAL,
            Id INTEGER,
            FOREIGN KEY (Id) REFERENCES DataTable (Id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_detections_id ON Detections (Id);
        CREATE INDEX IF NOT EXISTS idx_classifications_id ON Classifications (Id);",
    )?;
    Ok(())
}

/// Whether the store attached under `schema` carries recognition data.
pub(crate) fn tables_exist_in(conn: &Connection, schema: &str) -> Result<bool> {
    table_exists_in(conn, schema, DETECTIONS_TABLE)
}

/// Drop every recognition table when no detection is left.
/// Returns whether the tables were dropped.
pub(crate) fn drop_tables_if_empty(conn: &Connection) -> Result<bool> {
    if table_exists(conn, DETECTIONS_TABLE)? && row_count(conn, "main", DETECTIONS_TABLE)? > 0 {
        return Ok(false);
    }
    let mut dropped = false;
    for table in RECOGNITION_TABLES {
        if table_exists(conn, table)? {
            conn.execute_batch(&format!("DROP TABLE {}", table))?;
            dropped = true;
        }
    }
    if dropped {
        log::debug!("Dropped empty recognition tables");
    }
    Ok(dropped)
}

pub(crate) fn load_info_from(conn: &Connection, schema: &str) -> Result<Option<RecognitionInfo>> {
    if !table_exists_in(conn, schema, INFO_TABLE)? {
        return Ok(None);
    }
    let sql = format!(
        "SELECT {}, {}, {}, {}, {}, {}, {}, {} FROM {}.{} ORDER BY {} LIMIT 1",
        INFO_DETECTOR,
        INFO_DETECTOR_VERSION,
        INFO_DETECTION_COMPLETION_TIME,
        INFO_CLASSIFIER,
        INFO_CLASSIFICATION_COMPLETION_TIME,
        INFO_TYPICAL_DETECTION_THRESHOLD,
        INFO_CONSERVATIVE_DETECTION_THRESHOLD,
        INFO_TYPICAL_CLASSIFICATION_THRESHOLD,
        schema,
        INFO_TABLE,
        INFO_ID
    );
    let defaults = RecognitionInfo::default();
    let info = conn
        .query_row(&sql, [], |row| {
            let text = |i: usize, default: &str| -> rusqlite::Result<String> {
                Ok(row
                    .get::<_, Option<String>>(i)?
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| default.to_string()))
            };
            let number = |i: usize, default: f64| -> rusqlite::Result<f64> { Ok(row.get::<_, Option<f64>>(i)?.unwrap_or(default)) };
            Ok(RecognitionInfo {
                detector: text(0, &defaults.detector)?,
                detector_version: text(1, &defaults.detector_version)?,
                detection_completion_time: text(2, &defaults.detection_completion_time)?,
                classifier: text(3, &defaults.classifier)?,
                classification_completion_time: text(4, &defaults.classification_completion_time)?,
                typical_detection_threshold: number(5, defaults.typical_detection_threshold)?,
                conservative_detection_threshold: number(6, defaults.conservative_detection_threshold)?,
                typical_classification_threshold: number(7, defaults.typical_classification_threshold)?,
            })
        })
        .optional()?;
    Ok(info)
}

pub(crate) fn save_info(conn: &Connection, info: &RecognitionInfo) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", INFO_TABLE), [])?;
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            INFO_TABLE,
            INFO_ID,
            INFO_DETECTOR,
            INFO_DETECTOR_VERSION,
            INFO_DETECTION_COMPLETION_TIME,
            INFO_CLASSIFIER,
            INFO_CLASSIFICATION_COMPLETION_TIME,
            INFO_TYPICAL_DETECTION_THRESHOLD,
            INFO_CONSERVATIVE_DETECTION_THRESHOLD,
            INFO_TYPICAL_CLASSIFICATION_THRESHOLD
        ),
        params![
            info.detector,
            info.detector_version,
            info.detection_completion_time,
            info.classifier,
            info.classification_completion_time,
            info.typical_detection_threshold,
            info.conservative_detection_threshold,
            info.typical_classification_threshold
        ],
    )?;
    Ok(())
}

pub(crate) fn load_categories_from(conn: &Connection, schema: &str, table: &str) -> Result<CategoryDictionary> {
    if !table_exists_in(conn, schema, table)? {
        return Ok(CategoryDictionary::new());
    }
    let description = if table == CLASSIFICATION_CATEGORIES_TABLE {
        CATEGORY_DESCRIPTION
    } else {
        "''"
    };
    let sql = format!(
        "SELECT {}, {}, {} FROM {}.{}",
        CATEGORY, CATEGORY_LABEL, description, schema, table
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Category {
                    label: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                },
            ))
        })?
        .collect::<std::result::Result<CategoryDictionary, _>>()?;
    Ok(entries)
}

/// Replace the contents of a category table.
pub(crate) fn save_categories(conn: &Connection, table: &str, categories: &CategoryDictionary) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", table), [])?;
    let sql = if table == CLASSIFICATION_CATEGORIES_TABLE {
        format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
            table, CATEGORY, CATEGORY_LABEL, CATEGORY_DESCRIPTION
        )
    } else {
        format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
            table, CATEGORY, CATEGORY_LABEL
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    for (code, category) in categories {
        if table == CLASSIFICATION_CATEGORIES_TABLE {
            stmt.execute(params![code, category.label, category.description])?;
        } else {
            stmt.execute(params![code, category.label])?;
        }
    }
    Ok(())
}

impl RecordStore {
    pub fn recognition_info(&self) -> Result<Option<RecognitionInfo>> {
        load_info_from(self.conn(), "main")
    }

    pub fn detection_categories(&self) -> Result<CategoryDictionary> {
        load_categories_from(self.conn(), "main", DETECTION_CATEGORIES_TABLE)
    }

    pub fn classification_categories(&self) -> Result<CategoryDictionary> {
        load_categories_from(self.conn(), "main", CLASSIFICATION_CATEGORIES_TABLE)
    }

    pub fn detections_for(&self, id: i64) -> Result<Vec<Detection>> {
        if !table_exists(self.conn(), DETECTIONS_TABLE)? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {}, {}, {}, {}, {} FROM {} WHERE {} = ?1 ORDER BY {}",
            DETECTION_ID, ID, CATEGORY, CONF, BBOX, DETECTIONS_TABLE, ID, DETECTION_ID
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Detection {
                    detection_id: row.get(0)?,
                    id: row.get(1)?,
                    category: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    conf: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    bbox: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn classifications_for(&self, id: i64) -> Result<Vec<Classification>> {
        if !table_exists(self.conn(), CLASSIFICATIONS_TABLE)? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {}, {}, {}, {} FROM {} WHERE {} = ?1 ORDER BY {}",
            CLASSIFICATION_ID, ID, CATEGORY, CONF, CLASSIFICATIONS_TABLE, ID, CLASSIFICATION_ID
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Classification {
                    classification_id: row.get(0)?,
                    id: row.get(1)?,
                    category: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    conf: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn detection_count(&self) -> Result<usize> {
        if !table_exists(self.conn(), DETECTIONS_TABLE)? {
            return Ok(0);
        }
        Ok(row_count(self.conn(), "main", DETECTIONS_TABLE)? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, &str)]) -> CategoryDictionary {
        entries
            .iter()
            .map(|(code, label)| (code.to_string(), Category::new(*label)))
            .collect()
    }

    #[test]
    fn test_category_merge_is_a_union() {
        let ours = dict(&[("1", "Empty")]);
        let theirs = dict(&[("1", "Empty"), ("2", "Animal")]);
        let merged = merge_categories(&ours, &theirs).unwrap();
        assert_eq!(merged, theirs);
        assert_eq!(merge_categories(&theirs, &ours).unwrap(), theirs);
    }

    #[test]
    fn test_category_conflict_either_way() {
        let a = dict(&[("1", "Empty")]);
        let b = dict(&[("1", "Animal")]);
        for (ours, theirs) in [(&a, &b), (&b, &a)] {
            assert!(matches!(
                merge_categories(ours, theirs),
                Err(StoreError::CategoryConflict { code, .. }) if code == "1"
            ));
        }
    }

    #[test]
    fn test_info_merge_prefers_known_values() {
        let ours = RecognitionInfo {
            detector: "md_v5a.0.0.pt".into(),
            ..RecognitionInfo::default()
        };
        let theirs = RecognitionInfo {
            detector: "md_v4.1.0.pb".into(),
            classifier: "ecosystem1_v2".into(),
            typical_detection_threshold: 0.3,
            ..RecognitionInfo::default()
        };
        let merged = ours.merge_preferring(&theirs);
        assert_eq!(merged.detector, "md_v5a.0.0.pt");
        assert_eq!(merged.classifier, "ecosystem1_v2");
        assert_eq!(merged.typical_detection_threshold, 0.3);
        assert_eq!(merged.detector_version, DETECTOR_VERSION_UNKNOWN);
    }

    #[test]
    fn test_tables_round_trip_and_drop_when_empty() {
        let conn = crate::db::open_memory_db().unwrap();
        create_tables(&conn).unwrap();
        let info = RecognitionInfo {
            detector: "md".into(),
            ..RecognitionInfo::default()
        };
        save_info(&conn, &info).unwrap();
        assert_eq!(load_info_from(&conn, "main").unwrap(), Some(info));

        let mut categories = dict(&[("1", "Deer")]);
        categories.get_mut("1").unwrap().description = "Odocoileus".into();
        save_categories(&conn, CLASSIFICATION_CATEGORIES_TABLE, &categories).unwrap();
        assert_eq!(
            load_categories_from(&conn, "main", CLASSIFICATION_CATEGORIES_TABLE).unwrap(),
            categories
        );

        assert!(drop_tables_if_empty(&conn).unwrap());
        assert!(!tables_exist_in(&conn, "main").unwrap());
        assert_eq!(load_info_from(&conn, "main").unwrap(), None);
    }
}
