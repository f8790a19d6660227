// CSV export

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::config::{CsvDateMode, StoreConfig};
use crate::constants::*;
use crate::datetime::{format_date_time, format_date_time_t, format_legacy_date, format_legacy_time};
use crate::error::Result;
use crate::records::{FileRecord, RecordStore, SelectionSpec};
use crate::schema::definition::{FieldDescriptor, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub date_mode: CsvDateMode,
    /// `yyyy-MM-ddTHH:mm:ss` instead of a space between date and time.
    pub t_separator: bool,
    /// Prefix date and time cells with a space so spreadsheets keep them as text.
    pub leading_space: bool,
    pub include_root_folder: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl ExportOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            date_mode: config.csv_date_mode,
            t_separator: config.csv_t_separator,
            leading_space: config.csv_leading_space,
            include_root_folder: config.csv_include_root_folder,
        }
    }

    fn date_cell(&self, text: String) -> String {
        if self.leading_space {
            format!(" {}", text)
        } else {
            text
        }
    }
}

fn header(fields: &[&FieldDescriptor], options: &ExportOptions) -> Vec<String> {
    let mut header = Vec::with_capacity(fields.len() + 2);
    if options.include_root_folder {
        header.push(ROOT_FOLDER.to_string());
    }
    for field in fields {
        if field.value_type == ValueType::DateTime && options.date_mode == CsvDateMode::Split {
            header.push(DATE.to_string());
            header.push(TIME.to_string());
        } else {
            header.push(field.data_label.clone());
        }
    }
    header
}

fn row(record: &FileRecord, fields: &[&FieldDescriptor], root_folder: &str, options: &ExportOptions) -> Vec<String> {
    let mut row = Vec::with_capacity(fields.len() + 2);
    if options.include_root_folder {
        row.push(root_folder.to_string());
    }
    for field in fields {
        match (field.value_type, options.date_mode) {
            (ValueType::DateTime, CsvDateMode::Split) => {
                row.push(options.date_cell(format_legacy_date(&record.date_time)));
                row.push(options.date_cell(format_legacy_time(&record.date_time)));
            }
            (ValueType::DateTime, CsvDateMode::Single) => {
                let text = if options.t_separator {
                    format_date_time_t(&record.date_time)
                } else {
                    format_date_time(&record.date_time)
                };
                row.push(options.date_cell(text));
            }
            _ => row.push(record.value(&field.data_label).unwrap_or_default()),
        }
    }
    row
}

/// Write the records selected by `spec` as CSV. Returns the rows written.
pub fn write_csv<W: Write>(store: &RecordStore, spec: &SelectionSpec, options: &ExportOptions, writer: W) -> Result<usize> {
    let fields = store.schema().exportable_in_spreadsheet_order();
    let root_folder = if options.include_root_folder {
        store.image_set()?.root_folder
    } else {
        String::new()
    };
    let records = store.select(spec)?;

    let mut out = csv::Writer::from_writer(writer);
    out.write_record(header(&fields, options))?;
    for record in &records {
        out.write_record(row(record, &fields, &root_folder, options))?;
    }
    out.flush()?;
    Ok(records.len())
}

pub fn export_csv(store: &RecordStore, spec: &SelectionSpec, options: &ExportOptions, path: &Path) -> Result<usize> {
    let file = File::create(path)?;
    let written = write_csv(store, spec, options, file)?;
    log::info!("Exported {} records to {}", written, path.display());
    Ok(written)
}
