// Tabular exchange: CSV export of a view and CSV import as bulk update

pub mod export;
pub mod import;

#[cfg(test)]
mod tests;

pub use export::{export_csv, write_csv, ExportOptions};
pub use import::{import_csv, read_csv, ImportOutcome};
