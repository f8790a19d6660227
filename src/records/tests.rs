// Record store tests

use std::path::Path;

use super::*;
use crate::datetime::parse_date_time;
use crate::jobs::{with_silent_context, CancelToken, JobContext, JobProgress};
use tempfile::TempDir;

fn template() -> SchemaDefinition {
    let mut t = SchemaDefinition::image_template();
    t.add(FieldDescriptor::new("Species", ValueType::FixedChoice).with_choices(["Deer", "Elk", "Fox"]))
        .unwrap();
    t.add(FieldDescriptor::new("Count", ValueType::Counter)).unwrap();
    t.add(FieldDescriptor::new("Checked", ValueType::Flag)).unwrap();
    t.add(FieldDescriptor::new("Episode", ValueType::Note)).unwrap();
    t
}

fn at(text: &str) -> NaiveDateTime {
    parse_date_time(text).unwrap()
}

/// In-memory store holding six records across two folders.
fn seeded() -> RecordStore {
    let mut store = RecordStore::create_in_memory(&template(), StoreConfig::for_tests()).unwrap();
    let records = vec![
        NewFileRecord::new("Site1", "a.jpg", at("2024-01-01 08:00:00"))
            .with_field("Species", "Deer")
            .with_field("Count", "2")
            .with_field("Episode", "1:1|3"),
        NewFileRecord::new("Site1", "b.jpg", at("2024-01-01 08:00:01"))
            .with_field("Count", "10")
            .with_field("Episode", "1:2|3"),
        NewFileRecord::new("Site1", "c.jpg", at("2024-01-01 08:00:02")).with_field("Episode", "1:3|3"),
        NewFileRecord::new("Site2", "d.jpg", at("2024-01-02 09:00:00"))
            .with_field("Species", "Elk")
            .with_field("Count", "1")
            .with_field("Episode", "2:1|1"),
        NewFileRecord::new("Site2", "e.jpg", at("2024-01-02 09:30:00")).with_field("Checked", "True"),
        NewFileRecord::new("Site2", "e.jpg", at("2024-01-02 09:30:00")),
    ];
    let config = store.config().clone();
    let outcome = with_silent_context(&config, |ctx| store.bulk_insert(&records, ctx)).unwrap();
    assert_eq!(outcome, BatchOutcome { applied: 6, cancelled: false });
    store
}

#[test]
fn test_bulk_insert_assigns_ids_and_defaults() {
    let store = seeded();
    assert_eq!(store.count_all().unwrap(), 6);
    let c = store.get(3).unwrap().unwrap();
    assert_eq!(c.file, "c.jpg");
    assert_eq!(c.fields["Count"], "0");
    assert_eq!(c.fields["Checked"], "false");
    assert_eq!(c.fields["Species"], "");
    let e = store.get(5).unwrap().unwrap();
    assert_eq!(e.fields["Checked"], "true");
    assert!(store.get(7).unwrap().is_none());
}

#[test]
fn test_bulk_insert_rejects_invalid_values_before_writing() {
    let mut store = seeded();
    let records = vec![
        NewFileRecord::new("Site3", "x.jpg", at("2024-02-01 00:00:00")),
        NewFileRecord::new("Site3", "y.jpg", at("2024-02-01 00:00:00")).with_field("Species", "Moose"),
    ];
    let config = store.config().clone();
    let err = with_silent_context(&config, |ctx| store.bulk_insert(&records, ctx)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidValue { .. }));
    assert_eq!(store.count_all().unwrap(), 6);

    let structural = vec![NewFileRecord::new("Site3", "x.jpg", at("2024-02-01 00:00:00")).with_field(FILE, "z.jpg")];
    let err = with_silent_context(&config, |ctx| store.bulk_insert(&structural, ctx)).unwrap_err();
    assert!(matches!(err, StoreError::StructuralField(_)));
}

#[test]
fn test_bulk_insert_cancelled_keeps_committed_batches() {
    let mut store = RecordStore::create_in_memory(&template(), StoreConfig::for_tests()).unwrap();
    let records: Vec<NewFileRecord> = (0..7)
        .map(|i| NewFileRecord::new("S", format!("{}.jpg", i), at("2024-01-01 00:00:00")))
        .collect();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut events: Vec<JobProgress> = Vec::new();
    let mut sink = |p: &JobProgress| {
        events.push(p.clone());
        // Cancel after the first batch lands
        trigger.cancel();
    };
    let config = store.config().clone();
    let mut ctx = JobContext::new(&mut sink, cancel, &config);
    let outcome = store.bulk_insert(&records, &mut ctx).unwrap();
    drop(ctx);

    assert!(outcome.cancelled);
    assert_eq!(outcome.applied, 3);
    assert_eq!(store.count_all().unwrap(), 3);
    assert!(events.last().unwrap().is_cancelled);
}

#[test]
fn test_count_matches_select_for_every_join_and_filter() {
    let store = seeded();
    let specs = vec![
        SelectionSpec::all(),
        SelectionSpec::filtered(Predicate::compare("Count", Operator::Greater, "1")),
        SelectionSpec::filtered(Predicate::eq("Species", "Deer").or(Predicate::eq("Species", "Elk"))),
        SelectionSpec::filtered(Predicate::compare(FILE, Operator::Glob, "*.jpg").and(Predicate::eq("Checked", "TRUE"))),
        SelectionSpec::filtered(Predicate::eq("Species", "Deer")).with_episodes("Episode"),
        SelectionSpec::all().with_join(JoinMode::MissingDetections),
        SelectionSpec::all().with_join(JoinMode::Recognition(RecognitionFilter::detections(None, 0.0, 1.0))),
    ];
    for spec in specs {
        let rows = store.select(&spec).unwrap();
        assert_eq!(store.count_matching(&spec).unwrap(), rows.len(), "{:?}", spec);
        assert_eq!(store.exists_matching(&spec).unwrap(), !rows.is_empty(), "{:?}", spec);
    }
}

#[test]
fn test_counter_filter_is_numeric() {
    let store = seeded();
    // Text comparison would put "10" below "2"
    let spec = SelectionSpec::filtered(Predicate::compare("Count", Operator::Greater, "2"));
    let files: Vec<String> = store.select(&spec).unwrap().into_iter().map(|r| r.file).collect();
    assert_eq!(files, vec!["b.jpg"]);
}

#[test]
fn test_episode_match_pulls_in_whole_episode() {
    let store = seeded();
    let spec = SelectionSpec::filtered(Predicate::eq("Species", "Deer")).with_episodes("Episode");
    let files: Vec<String> = store.select(&spec).unwrap().into_iter().map(|r| r.file).collect();
    assert_eq!(files, vec!["a.jpg", "b.jpg", "c.jpg"]);

    // Records without an episode tag only match themselves
    let spec = SelectionSpec::filtered(Predicate::eq("Checked", "true")).with_episodes("Episode");
    assert_eq!(store.select_ids(&spec).unwrap(), vec![5]);
}

#[test]
fn test_default_and_explicit_sort() {
    let store = seeded();
    assert_eq!(store.select_ids(&SelectionSpec::all()).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    let spec = SelectionSpec::all().sorted_by(SortKey::desc(DATE_TIME));
    assert_eq!(store.select_ids(&spec).unwrap(), vec![5, 6, 4, 3, 2, 1]);
    let spec = SelectionSpec::all().sorted_by(SortKey::desc("Count")).sorted_by(SortKey::asc(FILE));
    assert_eq!(store.select_ids(&spec).unwrap()[..3], [2, 1, 4]);
}

#[test]
fn test_update_validates_and_never_inserts() {
    let mut store = seeded();
    store
        .update(3, &[FieldUpdate::new("Species", "Fox"), FieldUpdate::new("Checked", "TRUE")])
        .unwrap();
    let c = store.get(3).unwrap().unwrap();
    assert_eq!(c.fields["Species"], "Fox");
    assert_eq!(c.fields["Checked"], "true");

    assert!(matches!(
        store.update(3, &[FieldUpdate::new("Count", "many")]),
        Err(StoreError::InvalidValue { .. })
    ));
    assert!(matches!(
        store.update(3, &[FieldUpdate::new("Nope", "x")]),
        Err(StoreError::UnknownField(_))
    ));
    assert!(matches!(
        store.update(42, &[FieldUpdate::new("Species", "Fox")]),
        Err(StoreError::RecordNotFound(42))
    ));
    assert_eq!(store.count_all().unwrap(), 6);
}

#[test]
fn test_bulk_update_skips_missing_ids() {
    let mut store = seeded();
    let updates = vec![
        RecordUpdate::new(1).set("Count", "5"),
        RecordUpdate::new(99).set("Count", "5"),
        RecordUpdate::new(4).set("Count", "7").set(DELETE_FLAG, "true"),
    ];
    let config = store.config().clone();
    let outcome = with_silent_context(&config, |ctx| store.bulk_update(&updates, ctx)).unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(store.get(1).unwrap().unwrap().fields["Count"], "5");
    let d = store.get(4).unwrap().unwrap();
    assert_eq!(d.fields["Count"], "7");
    assert!(d.delete_flag);
}

#[test]
fn test_duplicates_and_keys() {
    let store = seeded();
    let dups = store.find_duplicate_keys().unwrap();
    assert_eq!(dups.len(), 1);
    assert!(dups.contains(&("Site2".to_string(), "e.jpg".to_string())));
    assert_eq!(store.ids_for_key("Site2", "e.jpg").unwrap(), vec![5, 6]);
    assert!(store.ids_for_key("Site2", "zzz.jpg").unwrap().is_empty());
    let by_key = store.ids_by_key().unwrap();
    assert_eq!(by_key.len(), 5);
    assert_eq!(by_key[&("Site1".to_string(), "a.jpg".to_string())], vec![1]);
}

#[test]
fn test_delete_and_remove_by_prefix() {
    let mut store = seeded();
    assert_eq!(store.delete_by_ids(&[1, 2, 77]).unwrap(), 2);
    assert_eq!(store.count_all().unwrap(), 4);
    assert_eq!(store.remove_by_path_prefix("Site2").unwrap(), 3);
    assert_eq!(store.select_ids(&SelectionSpec::all()).unwrap(), vec![3]);
}

#[test]
fn test_missing_files_uses_supplied_check() {
    let store = seeded();
    let root = Path::new("/photos");
    let present = root.join("Site1").join("a.jpg");
    let missing = store.missing_files(root, |p| p == present.as_path()).unwrap();
    assert_eq!(missing, vec![2, 3, 4, 5, 6]);
}

#[test]
fn test_field_changes_alter_the_data_table() {
    let mut store = seeded();
    store
        .add_field(FieldDescriptor::new("Notes", ValueType::Note).with_default("none"))
        .unwrap();
    assert_eq!(store.get(1).unwrap().unwrap().fields["Notes"], "none");

    store.rename_field("Count", "Individuals").unwrap();
    assert_eq!(store.get(2).unwrap().unwrap().fields["Individuals"], "10");
    assert!(store.schema().get("Count").is_none());

    store.remove_field("Episode").unwrap();
    assert!(!store.get(1).unwrap().unwrap().fields.contains_key("Episode"));
    assert!(matches!(store.remove_field(FILE), Err(StoreError::StructuralField(_))));

    // The template on disk follows the in-memory one
    assert_eq!(SchemaStore::image().load(store.conn()).unwrap(), *store.schema());
}

#[test]
fn test_reopen_from_disk_and_backup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("images.ddb");
    {
        let mut store = RecordStore::create(&path, &template(), StoreConfig::for_tests()).unwrap();
        let records = vec![NewFileRecord::new("", "root.jpg", at("2023-12-31 23:59:59"))];
        let config = store.config().clone();
        with_silent_context(&config, |ctx| store.bulk_insert(&records, ctx)).unwrap();
        // First mutation on a store with no snapshots takes one
        assert_eq!(crate::backup::list_backups(&path, BACKUP_FOLDER).len(), 1);
    }
    let store = RecordStore::open(&path, StoreConfig::for_tests()).unwrap();
    assert_eq!(store.schema(), &template());
    let record = store.get(1).unwrap().unwrap();
    assert_eq!(record.relative_path, "");
    assert_eq!(record.date_time, at("2023-12-31 23:59:59"));
    assert_eq!(store.image_set().unwrap().root_folder, dir.path().file_name().unwrap().to_string_lossy());

    assert!(matches!(
        RecordStore::create(&path, &template(), StoreConfig::for_tests()),
        Err(StoreError::StoreUnreadable(_))
    ));
}

#[test]
fn test_detections_cache_is_explicit() {
    let store = seeded();
    assert!(!store.has_detections().unwrap());
    store
        .conn()
        .execute_batch(
            "CREATE TABLE Detections (detectionID INTEGER PRIMARY KEY, category TEXT, conf REAL, bbox TEXT, Id INTEGER);
             INSERT INTO Detections (category, conf, bbox, Id) VALUES ('1', 0.9, '', 4);",
        )
        .unwrap();
    assert!(!store.has_detections().unwrap());
    store.invalidate_detections_cache();
    assert!(store.has_detections().unwrap());

    let spec = SelectionSpec::all().with_join(JoinMode::MissingDetections);
    assert_eq!(store.count_matching(&spec).unwrap(), 5);
    let spec = SelectionSpec::all().with_join(JoinMode::Recognition(RecognitionFilter::detections(Some("1"), 0.8, 1.0)));
    assert_eq!(store.select_ids(&spec).unwrap(), vec![4]);
}
