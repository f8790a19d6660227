// Recognition source: detector output file and its population into a store

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{
    create_tables, drop_tables_if_empty, load_categories_from, load_info_from, merge_categories, save_categories,
    save_info, Category, CategoryDictionary, RecognitionInfo,
};
use crate::constants::*;
use crate::error::Result;
use crate::jobs::{JobContext, JobProgress};
use crate::records::RecordStore;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorMetadata {
    pub megadetector_version: Option<String>,
    pub typical_detection_threshold: Option<f64>,
    pub conservative_detection_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifierMetadata {
    pub typical_classification_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceInfo {
    pub detector: Option<String>,
    pub detection_completion_time: Option<String>,
    pub classifier: Option<String>,
    pub classification_completion_time: Option<String>,
    #[serde(default)]
    pub detector_metadata: DetectorMetadata,
    #[serde(default)]
    pub classifier_metadata: ClassifierMetadata,
}

impl SourceInfo {
    fn to_info(&self) -> RecognitionInfo {
        let d = RecognitionInfo::default();
        let text = |v: &Option<String>, default: String| v.clone().filter(|s| !s.trim().is_empty()).unwrap_or(default);
        RecognitionInfo {
            detector: text(&self.detector, d.detector),
            detector_version: text(&self.detector_metadata.megadetector_version, d.detector_version),
            detection_completion_time: text(&self.detection_completion_time, d.detection_completion_time),
            classifier: text(&self.classifier, d.classifier),
            classification_completion_time: text(&self.classification_completion_time, d.classification_completion_time),
            typical_detection_threshold: self
                .detector_metadata
                .typical_detection_threshold
                .unwrap_or(d.typical_detection_threshold),
            conservative_detection_threshold: self
                .detector_metadata
                .conservative_detection_threshold
                .unwrap_or(d.conservative_detection_threshold),
            typical_classification_threshold: self
                .classifier_metadata
                .typical_classification_threshold
                .unwrap_or(d.typical_classification_threshold),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDetection {
    pub category: String,
    pub conf: f64,
    #[serde(default)]
    pub bbox: Vec<f64>,
    /// `[category, conf]` pairs from a classifier run on this detection.
    #[serde(default)]
    pub classifications: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceClassification {
    pub category: String,
    pub conf: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceImage {
    /// Store-relative path, `relativePath\file`.
    pub file: String,
    #[serde(default)]
    pub detections: Vec<SourceDetection>,
    #[serde(default)]
    pub classifications: Vec<SourceClassification>,
}

impl SourceImage {
    /// (RelativePath, File) key. Either separator is accepted.
    pub fn key(&self) -> (String, String) {
        let normalized = self.file.replace('/', "\\");
        match normalized.rsplit_once(PATH_SEPARATOR) {
            Some((relative_path, file)) => (relative_path.to_string(), file.to_string()),
            None => (String::new(), normalized),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionSource {
    #[serde(default)]
    pub info: SourceInfo,
    #[serde(default)]
    pub detection_categories: BTreeMap<String, String>,
    #[serde(default)]
    pub classification_categories: BTreeMap<String, String>,
    #[serde(default)]
    pub classification_category_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<SourceImage>,
}

impl RecognitionSource {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn recognition_info(&self) -> RecognitionInfo {
        self.info.to_info()
    }

    pub fn detection_dictionary(&self) -> CategoryDictionary {
        self.detection_categories
            .iter()
            .map(|(code, label)| (code.clone(), Category::new(label.clone())))
            .collect()
    }

    pub fn classification_dictionary(&self) -> CategoryDictionary {
        self.classification_categories
            .iter()
            .map(|(code, label)| {
                let description = self
                    .classification_category_descriptions
                    .get(code)
                    .cloned()
                    .unwrap_or_default();
                (code.clone(), Category { label: label.clone(), description })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulateOutcome {
    pub images_matched: usize,
    pub images_unmatched: usize,
    pub detections: usize,
    pub classifications: usize,
    pub cancelled: bool,
}

fn bbox_text(bbox: &[f64]) -> String {
    bbox.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}

impl RecordStore {
    /// Attach a detector run to the records it names. Runs in one
    /// transaction; cancellation rolls everything back. Images whose key
    /// matches duplicate records are attached to each of them.
    pub fn populate_recognition(&mut self, source: &RecognitionSource, ctx: &mut JobContext<'_>) -> Result<PopulateOutcome> {
        let keys = self.ids_by_key()?;
        let batch_size = self.config().import_batch_size.max(1);
        let total = source.images.len() as u64;
        self.backup_if_due()?;

        let mut outcome = PopulateOutcome::default();
        let tx = self.conn_mut().transaction()?;
        let existing_info = load_info_from(&tx, "main")?;
        let detection_categories = merge_categories(
            &load_categories_from(&tx, "main", DETECTION_CATEGORIES_TABLE)?,
            &source.detection_dictionary(),
        )?;
        let classification_categories = merge_categories(
            &load_categories_from(&tx, "main", CLASSIFICATION_CATEGORIES_TABLE)?,
            &source.classification_dictionary(),
        )?;
        create_tables(&tx)?;
        let info = match existing_info {
            Some(existing) => source.recognition_info().merge_preferring(&existing),
            None => source.recognition_info(),
        };
        save_info(&tx, &info)?;
        save_categories(&tx, DETECTION_CATEGORIES_TABLE, &detection_categories)?;
        save_categories(&tx, CLASSIFICATION_CATEGORIES_TABLE, &classification_categories)?;

        {
            let mut insert_detection = tx.prepare(&format!(
                "INSERT INTO {} ({}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4)",
                DETECTIONS_TABLE, CATEGORY, CONF, BBOX, ID
            ))?;
            let mut insert_classification = tx.prepare(&format!(
                "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                CLASSIFICATIONS_TABLE, CATEGORY, CONF, ID
            ))?;

            for (index, image) in source.images.iter().enumerate() {
                if index % batch_size == 0 {
                    if ctx.is_cancelled() {
                        outcome.cancelled = true;
                        break;
                    }
                    ctx.report(JobProgress::new("recognition", index as u64, total));
                }
                let Some(ids) = keys.get(&image.key()) else {
                    outcome.images_unmatched += 1;
                    continue;
                };
                outcome.images_matched += 1;
                for id in ids {
                    for detection in &image.detections {
                        insert_detection.execute(params![
                            detection.category,
                            detection.conf,
                            bbox_text(&detection.bbox),
                            id
                        ])?;
                        outcome.detections += 1;
                        for (category, conf) in &detection.classifications {
                            insert_classification.execute(params![category, conf, id])?;
                            outcome.classifications += 1;
                        }
                    }
                    for classification in &image.classifications {
                        insert_classification.execute(params![classification.category, classification.conf, id])?;
                        outcome.classifications += 1;
                    }
                }
            }
        }

        if outcome.cancelled {
            drop(tx);
            ctx.report(JobProgress::new("recognition", 0, total).cancelled());
            log::info!("Recognition population cancelled; nothing was written");
            return Ok(outcome);
        }
        tx.commit()?;
        self.invalidate_detections_cache();
        drop_tables_if_empty(self.conn())?;
        ctx.report(JobProgress::new("recognition", total, total).done());

        if outcome.images_unmatched > 0 {
            log::warn!(
                "{} recognition entries name files that are not in the store",
                outcome.images_unmatched
            );
        }
        log::info!(
            "Added {} detections and {} classifications to {} files",
            outcome.detections,
            outcome.classifications,
            outcome.images_matched
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::datetime::parse_date_time;
    use crate::error::StoreError;
    use crate::jobs::{with_silent_context, CancelToken};
    use crate::jobs::progress::NoProgress;
    use crate::records::{JoinMode, NewFileRecord, RecognitionFilter, SelectionSpec};
    use crate::schema::definition::SchemaDefinition;

    const SOURCE: &str = r#"{
        "info": {
            "detector": "md_v5a.0.0.pt",
            "detection_completion_time": "2024-03-01 10:00:00",
            "detector_metadata": {"megadetector_version": "v5a.0.0", "typical_detection_threshold": 0.25}
        },
        "detection_categories": {"1": "animal", "2": "person"},
        "classification_categories": {"7": "deer"},
        "images": [
            {"file": "site1\\a.jpg", "detections": [
                {"category": "1", "conf": 0.92, "bbox": [0.1, 0.2, 0.3, 0.4], "classifications": [["7", 0.8]]}
            ]},
            {"file": "site1/b.jpg", "detections": []},
            {"file": "elsewhere\\z.jpg", "detections": [{"category": "2", "conf": 0.5, "bbox": [0, 0, 1, 1]}]}
        ]
    }"#;

    fn store() -> RecordStore {
        let mut store =
            RecordStore::create_in_memory(&SchemaDefinition::image_template(), StoreConfig::for_tests()).unwrap();
        let dt = parse_date_time("2024-03-01 09:00:00").unwrap();
        let records = vec![
            NewFileRecord::new("site1", "a.jpg", dt),
            NewFileRecord::new("site1", "b.jpg", dt),
        ];
        let config = store.config().clone();
        with_silent_context(&config, |ctx| store.bulk_insert(&records, ctx)).unwrap();
        store
    }

    #[test]
    fn test_source_info_fills_unknowns() {
        let source = RecognitionSource::from_json(SOURCE).unwrap();
        let info = source.recognition_info();
        assert_eq!(info.detector_version, "v5a.0.0");
        assert_eq!(info.typical_detection_threshold, 0.25);
        assert_eq!(info.classifier, CLASSIFIER_UNKNOWN);
        assert_eq!(source.images[1].key(), ("site1".to_string(), "b.jpg".to_string()));
    }

    #[test]
    fn test_populate_attaches_to_matching_records() {
        let mut store = store();
        assert!(!store.has_detections().unwrap());
        let source = RecognitionSource::from_json(SOURCE).unwrap();
        let config = store.config().clone();
        let outcome = with_silent_context(&config, |ctx| store.populate_recognition(&source, ctx)).unwrap();
        assert_eq!(outcome.images_matched, 2);
        assert_eq!(outcome.images_unmatched, 1);
        assert_eq!(outcome.detections, 1);
        assert_eq!(outcome.classifications, 1);

        assert!(store.has_detections().unwrap());
        let ids = store.ids_for_key("site1", "a.jpg").unwrap();
        let detections = store.detections_for(ids[0]).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, "0.1, 0.2, 0.3, 0.4");
        assert_eq!(store.classifications_for(ids[0]).unwrap()[0].category, "7");
        assert_eq!(store.detection_categories().unwrap()["2"].label, "person");
        assert_eq!(store.recognition_info().unwrap().unwrap().detector, "md_v5a.0.0.pt");

        let spec = SelectionSpec::all().with_join(JoinMode::Recognition(RecognitionFilter::detections(
            Some("1"),
            0.5,
            1.0,
        )));
        assert_eq!(store.count_matching(&spec).unwrap(), 1);
        let missing = SelectionSpec::all().with_join(JoinMode::MissingDetections);
        assert_eq!(store.select(&missing).unwrap()[0].file, "b.jpg");
    }

    #[test]
    fn test_populate_without_detections_leaves_no_tables() {
        let mut store = store();
        let source = RecognitionSource::from_json(
            r#"{"detection_categories": {"1": "animal"}, "images": [{"file": "site1\\a.jpg", "detections": []}]}"#,
        )
        .unwrap();
        let config = store.config().clone();
        with_silent_context(&config, |ctx| store.populate_recognition(&source, ctx)).unwrap();
        assert!(!store.has_detections().unwrap());
        assert!(store.recognition_info().unwrap().is_none());
    }

    #[test]
    fn test_conflicting_categories_write_nothing() {
        let mut store = store();
        let config = store.config().clone();
        let source = RecognitionSource::from_json(SOURCE).unwrap();
        with_silent_context(&config, |ctx| store.populate_recognition(&source, ctx)).unwrap();

        let conflicting = RecognitionSource::from_json(
            r#"{"detection_categories": {"1": "vehicle"}, "images": [{"file": "site1\\b.jpg", "detections": [{"category": "1", "conf": 0.9}]}]}"#,
        )
        .unwrap();
        let result = with_silent_context(&config, |ctx| store.populate_recognition(&conflicting, ctx));
        assert!(matches!(result, Err(StoreError::CategoryConflict { .. })));
        assert_eq!(store.detection_count().unwrap(), 1);
    }

    #[test]
    fn test_cancelled_population_rolls_back() {
        let mut store = store();
        let source = RecognitionSource::from_json(SOURCE).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = store.config().clone();
        let mut sink = NoProgress;
        let mut ctx = JobContext::new(&mut sink, cancel, &config);
        let outcome = store.populate_recognition(&source, &mut ctx).unwrap();
        assert!(outcome.cancelled);
        assert!(!store.has_detections().unwrap());
        assert!(store.recognition_info().unwrap().is_none());
    }
}
