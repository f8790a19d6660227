// Image set settings: the singleton ImageSetTable row

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::query::{SelectionSpec, SortKey};
use super::RecordStore;
use crate::constants::*;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetSettings {
    pub root_folder: String,
    pub log: String,
    /// Last viewed row.
    pub row: i64,
    pub version: String,
    pub backwards_compatibility: String,
    pub sort_terms: Vec<SortKey>,
    pub search_terms: Option<SelectionSpec>,
    pub quick_paste_terms: String,
    pub bb_display_threshold: f64,
}

impl Default for ImageSetSettings {
    fn default() -> Self {
        Self {
            root_folder: String::new(),
            log: String::new(),
            row: 0,
            version: STORE_VERSION.to_string(),
            backwards_compatibility: BACKWARDS_COMPATIBILITY_VERSION.to_string(),
            sort_terms: Vec::new(),
            search_terms: None,
            quick_paste_terms: String::new(),
            bb_display_threshold: BB_DISPLAY_THRESHOLD_UNDEFINED,
        }
    }
}

impl ImageSetSettings {
    /// The persisted view: stored search terms with the stored sort applied.
    pub fn selection(&self) -> SelectionSpec {
        let mut spec = self.search_terms.clone().unwrap_or_default();
        if !self.sort_terms.is_empty() {
            spec.sort = self.sort_terms.clone();
        }
        spec
    }
}

pub(crate) fn insert_default_row(conn: &Connection, root_folder: &str) -> Result<()> {
    let settings = ImageSetSettings {
        root_folder: root_folder.to_string(),
        ..ImageSetSettings::default()
    };
    save(conn, &settings)
}

/// Stores written by older tools keep terms in formats we do not read;
/// those load as empty rather than failing the open.
fn decode_terms<T: serde::de::DeserializeOwned>(column: &str, text: Option<String>) -> Option<T> {
    let text = text.filter(|t| !t.trim().is_empty())?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring unreadable {}: {}", column, e);
            None
        }
    }
}

pub(crate) fn load(conn: &Connection) -> Result<ImageSetSettings> {
    let sql = format!(
        "SELECT RootFolder, Log, Row, VersionCompatabily, BackwardsCompatibility, SortTerms, \
         SearchTerms, QuickPasteTerms, BBDisplayThreshold FROM {} WHERE {} = ?1",
        IMAGE_SET_TABLE, ID
    );
    let row = conn
        .query_row(&sql, params![IMAGE_SET_ROW_ID], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<f64>>(8)?,
            ))
        })
        .optional()?;
    let Some((root, log, last_row, version, backwards, sort, search, quick_paste, threshold)) = row else {
        return Ok(ImageSetSettings::default());
    };
    let defaults = ImageSetSettings::default();
    Ok(ImageSetSettings {
        root_folder: root.unwrap_or_default(),
        log: log.unwrap_or_default(),
        row: last_row.unwrap_or(0),
        version: version.unwrap_or(defaults.version),
        backwards_compatibility: backwards.unwrap_or(defaults.backwards_compatibility),
        sort_terms: decode_terms(IMAGE_SET_SORT_TERMS, sort).unwrap_or_default(),
        search_terms: decode_terms(IMAGE_SET_SEARCH_TERMS, search),
        quick_paste_terms: quick_paste.unwrap_or_default(),
        bb_display_threshold: threshold.unwrap_or(BB_DISPLAY_THRESHOLD_UNDEFINED),
    })
}

pub(crate) fn save(conn: &Connection, s: &ImageSetSettings) -> Result<()> {
    let sort = serde_json::to_string(&s.sort_terms)?;
    let search = match &s.search_terms {
        Some(spec) => spec.to_json()?,
        None => String::new(),
    };
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (Id, RootFolder, Log, Row, VersionCompatabily, BackwardsCompatibility, \
             SortTerms, SearchTerms, QuickPasteTerms, BBDisplayThreshold) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            IMAGE_SET_TABLE
        ),
        params![
            IMAGE_SET_ROW_ID,
            s.root_folder,
            s.log,
            s.row,
            s.version,
            s.backwards_compatibility,
            sort,
            search,
            s.quick_paste_terms,
            s.bb_display_threshold
        ],
    )?;
    Ok(())
}

impl RecordStore {
    pub fn image_set(&self) -> Result<ImageSetSettings> {
        load(&self.conn)
    }

    pub fn save_image_set(&mut self, settings: &ImageSetSettings) -> Result<()> {
        self.backup_if_due()?;
        save(&self.conn, settings)
    }

    /// The view last saved in the image set row.
    pub fn current_selection(&self) -> Result<SelectionSpec> {
        Ok(self.image_set()?.selection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::records::query::Predicate;
    use crate::schema::definition::SchemaDefinition;

    #[test]
    fn test_new_store_has_default_row() {
        let store = RecordStore::create_in_memory(&SchemaDefinition::image_template(), StoreConfig::for_tests()).unwrap();
        let settings = store.image_set().unwrap();
        assert_eq!(settings.version, STORE_VERSION);
        assert_eq!(settings.bb_display_threshold, BB_DISPLAY_THRESHOLD_UNDEFINED);
        assert!(settings.search_terms.is_none());
    }

    #[test]
    fn test_settings_round_trip_and_selection() {
        let mut store =
            RecordStore::create_in_memory(&SchemaDefinition::image_template(), StoreConfig::for_tests()).unwrap();
        let mut settings = store.image_set().unwrap();
        settings.quick_paste_terms = "<QuickPastes/>".into();
        settings.bb_display_threshold = 0.4;
        settings.sort_terms = vec![SortKey::desc(FILE)];
        settings.search_terms = Some(SelectionSpec::filtered(Predicate::eq(DELETE_FLAG, "true")));
        store.save_image_set(&settings).unwrap();

        let loaded = store.image_set().unwrap();
        assert_eq!(loaded, settings);
        let selection = store.current_selection().unwrap();
        assert_eq!(selection.sort, vec![SortKey::desc(FILE)]);
        assert!(selection.filter.is_some());
    }

    #[test]
    fn test_legacy_terms_are_ignored() {
        let store = RecordStore::create_in_memory(&SchemaDefinition::image_template(), StoreConfig::for_tests()).unwrap();
        store
            .conn()
            .execute("UPDATE ImageSetTable SET SortTerms = 'RelativePath,File' WHERE Id = 1", [])
            .unwrap();
        assert!(store.image_set().unwrap().sort_terms.is_empty());
    }
}
