// Trapstore Error Types

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Store unreadable: {0}")]
    StoreUnreadable(String),

    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// `expected` is the authoritative type (sync reference, merge
    /// destination); `found` the type in the store being reconciled.
    #[error("Field '{label}' is {found} but {expected} is required")]
    SchemaTypeConflict {
        label: String,
        expected: String,
        found: String,
    },

    #[error("Templates are not merge compatible: {0}")]
    SchemaMismatch(String),

    #[error("Folder metadata levels do not match: {0}")]
    MetadataLevelMismatch(String),

    #[error("Category '{code}' is '{existing}' in one store but '{incoming}' in the other")]
    CategoryConflict {
        code: String,
        existing: String,
        incoming: String,
    },

    #[error("Invalid CSV header: {}", .0.join("; "))]
    CsvHeaderInvalid(Vec<String>),

    #[error("Invalid CSV values: {}", .0.join("; "))]
    CsvValueInvalid(Vec<String>),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field already exists: {0}")]
    DuplicateField(String),

    #[error("Standard field cannot be removed or renamed: {0}")]
    StructuralField(String),

    #[error("Invalid value '{value}' for field '{label}'")]
    InvalidValue { label: String, value: String },

    #[error("Record not found: {0}")]
    RecordNotFound(i64),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A non-fatal finding collected into operation reports.
/// `Display` renders the plain-text line shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Diagnostic {
    SchemaCosmeticDrift {
        label: String,
        attributes: Vec<String>,
    },
    ChoiceRemoved {
        label: String,
        choices: Vec<String>,
    },
    DuplicateCountMismatch {
        relative_path: String,
        file: String,
        stored: usize,
        imported: usize,
    },
    DateTimeNotUpdated {
        skipped: usize,
        total: usize,
    },
    LevelMismatch(String),
    Note(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::SchemaCosmeticDrift { label, attributes } => {
                write!(f, "{}: differs in {}", label, attributes.join(", "))
            }
            Diagnostic::ChoiceRemoved { label, choices } => write!(
                f,
                "{}: the choice(s) {} are no longer in the template; existing values are kept but cannot be selected",
                label,
                choices.join(", ")
            ),
            Diagnostic::DuplicateCountMismatch {
                relative_path,
                file,
                stored,
                imported,
            } => write!(
                f,
                "duplicate entry mismatch for {}: {} database entries vs. {} CSV entries.",
                join_relative(relative_path, file),
                stored,
                imported
            ),
            Diagnostic::DateTimeNotUpdated { skipped, total } => write!(
                f,
                "The Date/Time was not updated for {} / {} files.",
                skipped, total
            ),
            Diagnostic::LevelMismatch(msg) => write!(f, "folder levels: {}", msg),
            Diagnostic::Note(msg) => f.write_str(msg),
        }
    }
}

fn join_relative(relative_path: &str, file: &str) -> String {
    if relative_path.is_empty() {
        file.to_string()
    } else {
        format!("{}\\{}", relative_path, file)
    }
}

/// Render diagnostics as display lines, in order.
pub fn diagnostic_lines(diagnostics: &[Diagnostic]) -> Vec<String> {
    diagnostics.iter().map(|d| d.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_mismatch_line() {
        let d = Diagnostic::DuplicateCountMismatch {
            relative_path: "a".into(),
            file: "img.jpg".into(),
            stored: 2,
            imported: 3,
        };
        assert_eq!(
            d.to_string(),
            "duplicate entry mismatch for a\\img.jpg: 2 database entries vs. 3 CSV entries."
        );
    }

    #[test]
    fn test_header_error_joins_messages() {
        let e = StoreError::CsvHeaderInvalid(vec!["missing File".into(), "unknown Foo".into()]);
        assert_eq!(e.to_string(), "Invalid CSV header: missing File; unknown Foo");
    }
}
