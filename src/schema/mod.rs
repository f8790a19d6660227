// Schema module
// Templates: field definitions, their persistence and reconciliation.

pub mod definition;
pub mod store;
pub mod sync;

pub use definition::{FieldDescriptor, SchemaDefinition, ValueType};
pub use store::{SchemaStore, TemplateScope};
pub use sync::{SchemaSynchronizer, SyncReport};
