// CSV exchange tests

use super::*;
use crate::config::{CsvDateMode, StoreConfig};
use crate::constants::*;
use crate::datetime::parse_date_time;
use crate::error::{Diagnostic, StoreError};
use crate::jobs::progress::NoProgress;
use crate::jobs::{with_silent_context, CancelToken, JobContext};
use crate::records::{NewFileRecord, RecordStore, SelectionSpec};
use crate::schema::definition::{FieldDescriptor, SchemaDefinition, ValueType};

fn template() -> SchemaDefinition {
    let mut t = SchemaDefinition::image_template();
    t.add(FieldDescriptor::new("Species", ValueType::FixedChoice).with_choices(["Deer", "Elk"]))
        .unwrap();
    t.add(FieldDescriptor::new("Count", ValueType::Counter)).unwrap();
    t.add(FieldDescriptor::new("Checked", ValueType::Flag)).unwrap();
    t.add(FieldDescriptor::new("Notes", ValueType::Note)).unwrap();
    t
}

fn store(records: &[NewFileRecord]) -> RecordStore {
    let mut store = RecordStore::create_in_memory(&template(), StoreConfig::for_tests()).unwrap();
    let config = store.config().clone();
    with_silent_context(&config, |ctx| store.bulk_insert(records, ctx)).unwrap();
    store
}

fn sample() -> RecordStore {
    let dt = parse_date_time("2024-06-01 07:15:00").unwrap();
    store(&[
        NewFileRecord::new("Site1", "a.jpg", dt)
            .with_field("Species", "Deer")
            .with_field("Count", "2")
            .with_field("Notes", "doe, \"big\" one"),
        NewFileRecord::new("Site1\\Cam2", "b.jpg", dt).with_field("Checked", "true"),
    ])
}

fn export(store: &RecordStore, options: &ExportOptions) -> String {
    let mut out = Vec::new();
    write_csv(store, &SelectionSpec::all(), options, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn import(store: &mut RecordStore, text: &str) -> crate::error::Result<ImportOutcome> {
    let config = store.config().clone();
    with_silent_context(&config, |ctx| read_csv(store, text.as_bytes(), ctx))
}

fn blank_copy(source: &RecordStore) -> RecordStore {
    let dt = parse_date_time("1900-01-01 12:00:00").unwrap();
    let records = source
        .select(&SelectionSpec::all())
        .unwrap()
        .into_iter()
        .map(|r| NewFileRecord::new(r.relative_path, r.file, dt))
        .collect::<Vec<_>>();
    store(&records)
}

fn comparable(store: &RecordStore) -> Vec<(String, String, String, std::collections::BTreeMap<String, String>)> {
    store
        .select(&SelectionSpec::all())
        .unwrap()
        .into_iter()
        .map(|r| {
            let dt = r.value(DATE_TIME).unwrap();
            (r.relative_path, r.file, dt, r.fields)
        })
        .collect()
}

#[test]
fn test_export_header_and_quoting() {
    let text = export(&sample(), &ExportOptions::from_config(&StoreConfig::for_tests()));
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "File,RelativePath,DateTime,DeleteFlag,Species,Count,Checked,Notes"
    );
    assert_eq!(
        lines.next().unwrap(),
        "a.jpg,Site1,2024-06-01 07:15:00,false,Deer,2,false,\"doe, \"\"big\"\" one\""
    );
}

#[test]
fn test_export_split_date_with_root_folder() {
    let options = ExportOptions {
        date_mode: CsvDateMode::Split,
        t_separator: false,
        leading_space: true,
        include_root_folder: true,
    };
    let text = export(&sample(), &options);
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "RootFolder,File,RelativePath,Date,Time,DeleteFlag,Species,Count,Checked,Notes"
    );
    assert!(lines.next().unwrap().starts_with(",a.jpg,Site1, 01-Jun-2024, 07:15:00,false"));
}

#[test]
fn test_export_skips_fields_not_exported() {
    let mut t = SchemaDefinition::image_template();
    t.add(FieldDescriptor::new("Internal", ValueType::Note).not_exported().hidden())
        .unwrap();
    t.add(FieldDescriptor::new("Notes", ValueType::Note).with_label("Remarks"))
        .unwrap();
    let store = RecordStore::create_in_memory(&t, StoreConfig::for_tests()).unwrap();
    let text = export(&store, &ExportOptions::from_config(&StoreConfig::for_tests()));
    assert_eq!(text.trim_end(), "File,RelativePath,DateTime,DeleteFlag,Notes");
}

#[test]
fn test_single_column_round_trip() {
    let source = sample();
    for t_separator in [false, true] {
        let options = ExportOptions {
            t_separator,
            ..ExportOptions::from_config(&StoreConfig::for_tests())
        };
        let text = export(&source, &options);
        let mut target = blank_copy(&source);
        let outcome = import(&mut target, &text).unwrap();
        assert_eq!(outcome.rows_read, 2);
        assert_eq!(outcome.updated, 2);
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(comparable(&target), comparable(&source));
    }
}

#[test]
fn test_split_date_round_trip() {
    let source = sample();
    let options = ExportOptions {
        date_mode: CsvDateMode::Split,
        t_separator: false,
        leading_space: true,
        include_root_folder: true,
    };
    let text = export(&source, &options);
    let mut target = blank_copy(&source);
    let outcome = import(&mut target, &text).unwrap();
    assert_eq!(outcome.updated, 2);
    assert_eq!(comparable(&target), comparable(&source));
}

#[test]
fn test_duplicates_pair_in_encounter_order() {
    let dt = parse_date_time("2024-06-01 07:15:00").unwrap();
    let mut target = store(&[
        NewFileRecord::new("S", "dup.jpg", dt),
        NewFileRecord::new("S", "dup.jpg", dt),
        NewFileRecord::new("S", "one.jpg", dt),
    ]);
    let text = "File,RelativePath,Notes\n\
                dup.jpg,S,first\n\
                one.jpg,S,single-a\n\
                dup.jpg,S,second\n\
                one.jpg,S,single-b\n\
                dup.jpg,S,third\n";
    let outcome = import(&mut target, text).unwrap();
    assert_eq!(outcome.updated, 3);
    assert_eq!(
        outcome.diagnostics,
        vec![
            Diagnostic::DuplicateCountMismatch {
                relative_path: "S".into(),
                file: "dup.jpg".into(),
                stored: 2,
                imported: 3,
            },
            Diagnostic::DuplicateCountMismatch {
                relative_path: "S".into(),
                file: "one.jpg".into(),
                stored: 1,
                imported: 2,
            },
        ]
    );
    assert_eq!(target.get(1).unwrap().unwrap().fields["Notes"], "first");
    assert_eq!(target.get(2).unwrap().unwrap().fields["Notes"], "second");
    assert_eq!(target.get(3).unwrap().unwrap().fields["Notes"], "single-a");
}

#[test]
fn test_single_row_updates_first_stored_duplicate() {
    let dt = parse_date_time("2024-06-01 07:15:00").unwrap();
    let mut target = store(&[NewFileRecord::new("S", "dup.jpg", dt), NewFileRecord::new("S", "dup.jpg", dt)]);
    let outcome = import(&mut target, "File,RelativePath,Notes\ndup.jpg,S,only\n").unwrap();
    assert_eq!(outcome.updated, 1);
    assert_eq!(
        outcome.diagnostics,
        vec![Diagnostic::DuplicateCountMismatch {
            relative_path: "S".into(),
            file: "dup.jpg".into(),
            stored: 2,
            imported: 1,
        }]
    );
    assert_eq!(target.get(1).unwrap().unwrap().fields["Notes"], "only");
    assert_eq!(target.get(2).unwrap().unwrap().fields["Notes"], "");
}

#[test]
fn test_key_cells_are_trimmed_alike() {
    let mut target = sample();
    let text = "File,RelativePath,Species\n a.jpg , Site1 ,Elk\nb.jpg,  Site1\\Cam2\\ ,Elk\n";
    let outcome = import(&mut target, text).unwrap();
    assert_eq!(outcome.updated, 2);
    assert!(outcome.diagnostics.is_empty());
    assert_eq!(target.get(1).unwrap().unwrap().fields["Species"], "Elk");
    assert_eq!(target.get(2).unwrap().unwrap().fields["Species"], "Elk");
}

#[test]
fn test_header_problems_are_fatal() {
    let mut target = sample();
    let err = import(&mut target, "File,Species,Colour\na.jpg,Deer,red\n").unwrap_err();
    let StoreError::CsvHeaderInvalid(problems) = err else {
        panic!("expected a header error");
    };
    assert_eq!(problems.len(), 2);
    assert!(problems.iter().any(|p| p.contains("Colour")));
    assert!(problems.iter().any(|p| p.contains(RELATIVE_PATH)));

    assert!(matches!(
        import(&mut target, "File,RelativePath\n"),
        Err(StoreError::CsvHeaderInvalid(_))
    ));
    // Legacy and synthetic columns are tolerated.
    let ok = import(&mut target, "File,RelativePath,Folder,ImageQuality\na.jpg,Site1,x,Ok\n").unwrap();
    assert_eq!(ok.updated, 1);
}

#[test]
fn test_invalid_values_abort_before_writing() {
    let mut target = sample();
    let text = "File,RelativePath,Species,Count,Checked\n\
                a.jpg,Site1,Moose,1,true\n\
                b.jpg,Site1\\Cam2,Elk,many,maybe\n\
                a.jpg,Site1,Fox,1,true\n";
    let err = import(&mut target, text).unwrap_err();
    let StoreError::CsvValueInvalid(problems) = err else {
        panic!("expected a value error");
    };
    // Two rows reported (three problems), the third row never looked at.
    assert_eq!(problems.len(), 3);
    assert!(problems[0].starts_with("row 2"));
    assert!(problems.iter().all(|p| !p.starts_with("row 4")));
    assert_eq!(target.get(1).unwrap().unwrap().fields["Species"], "Deer");
}

#[test]
fn test_unparseable_dates_keep_stored_value() {
    let mut target = sample();
    let text = "File,RelativePath,DateTime,Species\n\
                a.jpg,Site1,not a date,Elk\n\
                b.jpg,Site1\\Cam2,2025-01-02 03:04:05,Deer\n\
                gone.jpg,Site1,2025-01-02 03:04:05,Deer\n";
    let outcome = import(&mut target, text).unwrap();
    assert_eq!(outcome.rows_read, 3);
    assert_eq!(outcome.updated, 2);
    assert_eq!(
        outcome.diagnostics,
        vec![Diagnostic::DateTimeNotUpdated { skipped: 1, total: 2 }]
    );
    let a = target.get(1).unwrap().unwrap();
    assert_eq!(a.value(DATE_TIME).unwrap(), "2024-06-01 07:15:00");
    assert_eq!(a.fields["Species"], "Elk");
    assert_eq!(target.get(2).unwrap().unwrap().value(DATE_TIME).unwrap(), "2025-01-02 03:04:05");
}

#[test]
fn test_cancelled_import_keeps_nothing_past_the_first_batch() {
    let mut target = sample();
    let cancel = CancelToken::new();
    cancel.cancel();
    let config = target.config().clone();
    let mut sink = NoProgress;
    let mut ctx = JobContext::new(&mut sink, cancel, &config);
    let outcome = read_csv(
        &mut target,
        "File,RelativePath,Species\na.jpg,Site1,Elk\n".as_bytes(),
        &mut ctx,
    )
    .unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.updated, 0);
    assert_eq!(target.get(1).unwrap().unwrap().fields["Species"], "Deer");
}
