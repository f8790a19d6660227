// Schema synchronizer
// Reconciles the template found inside a store (resident) with an
// authoritative one (reference). Comparing is pure; applying runs in one
// transaction on the store.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Diagnostic, Result, StoreError};
use crate::levels::{add_level_field_in, create_level_in, remove_level_field_in, LevelDescriptor};
use crate::records::{add_field_in, markers, remove_field_in, rename_field_in, RecordStore};
use crate::schema::definition::{SchemaDefinition, ValueType};
use crate::schema::store::SchemaStore;

/// Field-level differences for one template.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChanges {
    /// Reference labels missing from the resident, in reference order.
    pub added: Vec<String>,
    /// Resident labels missing from the reference, in resident order.
    pub removed: Vec<String>,
    /// Confirmed (resident label, reference label) pairs.
    pub renamed: Vec<(String, String)>,
    pub cosmetically_changed: Vec<String>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.renamed.is_empty()
            && self.cosmetically_changed.is_empty()
    }

    fn has_structural_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.renamed.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelChanges {
    pub level: i64,
    pub changes: FieldChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fields: FieldChanges,
    /// Matched folder levels that differ.
    pub levels: Vec<LevelChanges>,
    /// Reference levels below the resident's deepest level.
    pub levels_added: Vec<LevelDescriptor>,
    /// The level hierarchies disagree; level changes are not applied.
    pub level_mismatch: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl SyncReport {
    /// Nothing to apply and nothing to warn about.
    pub fn is_clean(&self) -> bool {
        self.fields.is_empty()
            && self.levels.is_empty()
            && self.levels_added.is_empty()
            && !self.level_mismatch
            && self.diagnostics.is_empty()
    }
}

/// Reference template and levels plus user-confirmed renames.
#[derive(Debug, Clone)]
pub struct SchemaSynchronizer {
    reference: SchemaDefinition,
    reference_levels: Vec<LevelDescriptor>,
    renames: Vec<(String, String)>,
    copy_cosmetics: bool,
}

impl SchemaSynchronizer {
    pub fn new(reference: SchemaDefinition) -> Self {
        Self {
            reference,
            reference_levels: Vec::new(),
            renames: Vec::new(),
            copy_cosmetics: true,
        }
    }

    pub fn with_levels(mut self, levels: Vec<LevelDescriptor>) -> Self {
        self.reference_levels = levels;
        self
    }

    /// Treat `from` (resident) and `to` (reference) as the same field.
    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.push((from.into(), to.into()));
        self
    }

    /// Leave display attributes as they are in the store.
    pub fn keep_cosmetics(mut self) -> Self {
        self.copy_cosmetics = false;
        self
    }

    /// Compare against a store's resident template and levels.
    pub fn compare(&self, resident: &SchemaDefinition, resident_levels: &[LevelDescriptor]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        report.fields = compare_fields(&self.reference, resident, &self.renames, &mut report.diagnostics)?;
        self.compare_levels(resident_levels, &mut report)?;
        for d in &report.diagnostics {
            log::warn!("{}", d);
        }
        Ok(report)
    }

    fn compare_levels(&self, resident: &[LevelDescriptor], report: &mut SyncReport) -> Result<()> {
        for (reference, found) in self.reference_levels.iter().zip(resident) {
            if !reference.matches(found) {
                report.level_mismatch = true;
                report.diagnostics.push(Diagnostic::LevelMismatch(format!(
                    "level {} is '{}' in the template but '{}' in the store",
                    reference.level,
                    reference.name(),
                    found.name()
                )));
                return Ok(());
            }
            let changes = compare_fields(&reference.schema, &found.schema, &[], &mut report.diagnostics)?;
            if !changes.is_empty() {
                report.levels.push(LevelChanges {
                    level: found.level,
                    changes,
                });
            }
        }
        if resident.len() > self.reference_levels.len() {
            report.level_mismatch = true;
            report.diagnostics.push(Diagnostic::LevelMismatch(format!(
                "the store has {} levels but the template only {}",
                resident.len(),
                self.reference_levels.len()
            )));
        } else {
            report.levels_added = self.reference_levels[resident.len()..].to_vec();
        }
        Ok(())
    }

    /// Compare with the store's template and apply the result.
    pub fn synchronize(&self, store: &mut RecordStore) -> Result<SyncReport> {
        let resident_levels = store.levels()?;
        let report = self.compare(store.schema(), &resident_levels)?;
        if report.fields.is_empty() && report.levels.is_empty() && report.levels_added.is_empty() {
            return Ok(report);
        }
        self.apply(store, &report)?;
        log::info!(
            "Synchronized template: {} added, {} removed, {} renamed, {} restyled",
            report.fields.added.len(),
            report.fields.removed.len(),
            report.fields.renamed.len(),
            report.fields.cosmetically_changed.len()
        );
        Ok(report)
    }

    /// Apply a report produced by [`Self::compare`] in one transaction.
    pub fn apply(&self, store: &mut RecordStore, report: &SyncReport) -> Result<()> {
        let reference = &self.reference;
        let copy_cosmetics = self.copy_cosmetics;
        store.evolve_schema(|conn, schema_store, schema| {
            apply_image_changes(conn, schema_store, schema, reference, &report.fields, copy_cosmetics)?;
            if !report.level_mismatch {
                self.apply_level_changes(conn, report)?;
            }
            Ok(())
        })?;
        store.invalidate_detections_cache();
        Ok(())
    }

    fn apply_level_changes(&self, conn: &Connection, report: &SyncReport) -> Result<()> {
        for level_changes in &report.levels {
            let level = level_changes.level;
            let reference = self
                .reference_levels
                .iter()
                .find(|l| l.level == level)
                .ok_or_else(|| StoreError::MetadataLevelMismatch(format!("no reference level {}", level)))?;
            let store = SchemaStore::level(level);
            let mut schema = store.load(conn)?;
            for label in &level_changes.changes.removed {
                remove_level_field_in(conn, level, &mut schema, label)?;
            }
            for label in &level_changes.changes.added {
                add_level_field_in(conn, level, &mut schema, reference.schema.require(label)?.clone())?;
            }
            if self.copy_cosmetics {
                copy_reference_cosmetics(&mut schema, &reference.schema);
                store.save(conn, &schema)?;
            }
        }
        for level in &report.levels_added {
            create_level_in(conn, level)?;
        }
        Ok(())
    }
}

fn compare_fields(
    reference: &SchemaDefinition,
    resident: &SchemaDefinition,
    renames: &[(String, String)],
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<FieldChanges> {
    let reference_labels: HashSet<&str> = reference.data_labels().into_iter().collect();
    let resident_labels: HashSet<&str> = resident.data_labels().into_iter().collect();

    let mut changes = FieldChanges {
        added: reference
            .data_labels()
            .into_iter()
            .filter(|l| !resident_labels.contains(l))
            .map(str::to_string)
            .collect(),
        removed: resident
            .data_labels()
            .into_iter()
            .filter(|l| !reference_labels.contains(l))
            .map(str::to_string)
            .collect(),
        ..FieldChanges::default()
    };

    for (from, to) in renames {
        let (Some(removed_at), Some(added_at)) = (
            changes.removed.iter().position(|l| l == from),
            changes.added.iter().position(|l| l == to),
        ) else {
            return Err(StoreError::UnknownField(format!("{} -> {}", from, to)));
        };
        let old = resident.require(from)?;
        let new = reference.require(to)?;
        if old.value_type != new.value_type {
            return Err(StoreError::SchemaTypeConflict {
                label: to.clone(),
                expected: new.value_type.to_string(),
                found: old.value_type.to_string(),
            });
        }
        changes.removed.remove(removed_at);
        changes.added.remove(added_at);
        changes.renamed.push((from.clone(), to.clone()));
    }

    // Type conflicts abort before anything else is reported
    for field in reference.fields() {
        if let Some(found) = resident.get(&field.data_label) {
            if found.value_type != field.value_type {
                return Err(StoreError::SchemaTypeConflict {
                    label: field.data_label.clone(),
                    expected: field.value_type.to_string(),
                    found: found.value_type.to_string(),
                });
            }
        }
    }

    for field in reference.fields() {
        let Some(found) = resident.get(&field.data_label) else {
            continue;
        };
        let attributes = field.cosmetic_differences(found);
        if !attributes.is_empty() {
            changes.cosmetically_changed.push(field.data_label.clone());
            diagnostics.push(Diagnostic::SchemaCosmeticDrift {
                label: field.data_label.clone(),
                attributes,
            });
        }
        if field.value_type == ValueType::FixedChoice {
            let dropped: Vec<String> = found
                .choices
                .iter()
                .filter(|c| !field.choices.contains(c))
                .cloned()
                .collect();
            if !dropped.is_empty() {
                diagnostics.push(Diagnostic::ChoiceRemoved {
                    label: field.data_label.clone(),
                    choices: dropped,
                });
            }
        }
    }
    Ok(changes)
}

fn apply_image_changes(
    conn: &Connection,
    store: &SchemaStore,
    schema: &mut SchemaDefinition,
    reference: &SchemaDefinition,
    changes: &FieldChanges,
    copy_cosmetics: bool,
) -> Result<()> {
    for (from, to) in &changes.renamed {
        rename_field_in(conn, store, schema, from, to)?;
    }
    for label in &changes.removed {
        remove_field_in(conn, store, schema, label)?;
    }
    for label in &changes.added {
        add_field_in(conn, store, schema, reference.require(label)?.clone())?;
    }
    if changes.has_structural_changes() {
        let counters: Vec<String> = schema.counters().map(|f| f.data_label.clone()).collect();
        markers::delete_empty_rows(conn, &counters)?;
    }
    if copy_cosmetics {
        copy_reference_cosmetics(schema, reference);
        store.save(conn, schema)?;
    }
    Ok(())
}

/// Copy display attributes (orders included) for every shared field, then
/// make the orders contiguous again.
fn copy_reference_cosmetics(schema: &mut SchemaDefinition, reference: &SchemaDefinition) {
    for field in reference.fields() {
        if let Some(found) = schema.get_mut(&field.data_label) {
            found.copy_cosmetics_from(field);
        }
    }
    schema.renumber();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::datetime::parse_date_time;
    use crate::jobs::with_silent_context;
    use crate::records::{NewFileRecord, Point};
    use crate::schema::definition::FieldDescriptor;

    fn resident() -> SchemaDefinition {
        let mut s = SchemaDefinition::image_template();
        s.add(FieldDescriptor::new("Species", ValueType::FixedChoice).with_choices(["Deer", "Elk", "Moose"]))
            .unwrap();
        s.add(FieldDescriptor::new("Count", ValueType::Counter)).unwrap();
        s.add(FieldDescriptor::new("Old", ValueType::Note)).unwrap();
        s.add(FieldDescriptor::new("Adults", ValueType::Counter)).unwrap();
        s
    }

    fn reference() -> SchemaDefinition {
        let mut s = SchemaDefinition::image_template();
        s.add(FieldDescriptor::new("Species", ValueType::FixedChoice).with_choices(["Deer", "Elk"]))
            .unwrap();
        s.add(FieldDescriptor::new("Individuals", ValueType::Counter).with_tooltip("Animals in view"))
            .unwrap();
        s.add(FieldDescriptor::new("Notes", ValueType::Note)).unwrap();
        s
    }

    fn store() -> RecordStore {
        let mut store = RecordStore::create_in_memory(&resident(), StoreConfig::for_tests()).unwrap();
        let dt = parse_date_time("2024-06-01 12:00:00").unwrap();
        let records = vec![
            NewFileRecord::new("a", "1.jpg", dt).with_field("Count", "3").with_field("Old", "x"),
            NewFileRecord::new("a", "2.jpg", dt),
        ];
        let config = store.config().clone();
        with_silent_context(&config, |ctx| store.bulk_insert(&records, ctx)).unwrap();
        store.set_markers(1, "Count", &[Point { x: 0.1, y: 0.2 }]).unwrap();
        store.set_markers(2, "Adults", &[Point { x: 0.3, y: 0.4 }]).unwrap();
        store
    }

    #[test]
    fn test_compare_finds_candidates_and_warnings() {
        let sync = SchemaSynchronizer::new(reference()).with_rename("Count", "Individuals");
        let report = sync.compare(&resident(), &[]).unwrap();
        assert_eq!(report.fields.added, vec!["Notes"]);
        assert_eq!(report.fields.removed, vec!["Old", "Adults"]);
        assert_eq!(report.fields.renamed, vec![("Count".to_string(), "Individuals".to_string())]);
        assert!(report.fields.cosmetically_changed.contains(&"Species".to_string()));
        assert!(report.diagnostics.contains(&Diagnostic::ChoiceRemoved {
            label: "Species".into(),
            choices: vec!["Moose".into()],
        }));
    }

    #[test]
    fn test_type_conflict_aborts_before_changes() {
        let mut reference = reference();
        reference.remove("Notes").unwrap();
        reference.add(FieldDescriptor::new("Old", ValueType::Flag)).unwrap();
        let mut store = store();
        let before = store.schema().clone();
        let err = SchemaSynchronizer::new(reference).synchronize(&mut store).unwrap_err();
        assert!(matches!(err, StoreError::SchemaTypeConflict { label, .. } if label == "Old"));
        assert_eq!(store.schema(), &before);
    }

    #[test]
    fn test_apply_preserves_renamed_data_and_markers() {
        let mut store = store();
        let sync = SchemaSynchronizer::new(reference()).with_rename("Count", "Individuals");
        sync.synchronize(&mut store).unwrap();

        assert_eq!(store.schema(), &reference());
        let first = store.get(1).unwrap().unwrap();
        assert_eq!(first.fields["Individuals"], "3");
        assert_eq!(first.fields["Notes"], "");
        assert!(!first.fields.contains_key("Old"));

        // Record 2 only had Adults markers; its row is now empty and gone
        assert!(store.markers(2).unwrap().is_none());
        let markers = store.markers(1).unwrap().unwrap();
        assert_eq!(markers.points["Individuals"], vec![Point { x: 0.1, y: 0.2 }]);
        assert_eq!(SchemaStore::image().load(store.conn()).unwrap(), reference());
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut store = store();
        let sync = SchemaSynchronizer::new(reference()).with_rename("Count", "Individuals");
        sync.synchronize(&mut store).unwrap();

        let again = SchemaSynchronizer::new(reference())
            .compare(store.schema(), &store.levels().unwrap())
            .unwrap();
        assert!(again.is_clean(), "{:?}", again);
    }

    #[test]
    fn test_keep_cosmetics_leaves_display_attributes() {
        let mut store = store();
        let sync = SchemaSynchronizer::new(reference())
            .with_rename("Count", "Individuals")
            .keep_cosmetics();
        sync.synchronize(&mut store).unwrap();
        assert_eq!(store.schema().get("Individuals").unwrap().tooltip, "");
        assert_eq!(store.schema().get("Species").unwrap().choices, vec!["Deer", "Elk", "Moose"]);
    }

    #[test]
    fn test_bad_rename_is_rejected() {
        let sync = SchemaSynchronizer::new(reference()).with_rename("Count", "Nope");
        assert!(matches!(sync.compare(&resident(), &[]), Err(StoreError::UnknownField(_))));
    }

    #[test]
    fn test_levels_are_compared_and_appended() {
        let mut store = store();
        let mut site = SchemaDefinition::new();
        site.add(FieldDescriptor::new("Habitat", ValueType::Text)).unwrap();
        let resident_site = store.add_level("Site", site.clone()).unwrap();

        let mut reference_site = resident_site.clone();
        reference_site.schema.add(FieldDescriptor::new("Elevation", ValueType::Counter)).unwrap();
        let mut camera = SchemaDefinition::new();
        camera.add(FieldDescriptor::new("Model", ValueType::Text)).unwrap();
        let reference_camera = LevelDescriptor::new(2, "Camera", camera);

        let sync = SchemaSynchronizer::new(store.schema().clone())
            .with_levels(vec![reference_site.clone(), reference_camera.clone()]);
        let report = sync.synchronize(&mut store).unwrap();
        assert_eq!(report.levels.len(), 1);
        assert_eq!(report.levels[0].changes.added, vec!["Elevation"]);
        assert_eq!(report.levels_added.len(), 1);

        let levels = store.levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].schema, reference_site.schema);
        assert_eq!(levels[1].guid, reference_camera.guid);

        let other = LevelDescriptor::new(1, "Region", SchemaDefinition::new());
        let report = SchemaSynchronizer::new(store.schema().clone())
            .with_levels(vec![other])
            .compare(store.schema(), &levels)
            .unwrap();
        assert!(report.level_mismatch);
    }
}
