// Trapstore Library Entry Point

pub mod backup;
pub mod config;
pub mod constants;
pub mod datetime;
pub mod db;
pub mod error;
pub mod exchange;
pub mod jobs;
pub mod levels;
pub mod merge;
pub mod paths;
pub mod recognition;
pub mod records;
pub mod schema;

pub use config::StoreConfig;
pub use error::{Diagnostic, Result, StoreError};
pub use records::{FileRecord, NewFileRecord, RecordStore, SelectionSpec};
pub use schema::definition::{FieldDescriptor, SchemaDefinition, ValueType};
