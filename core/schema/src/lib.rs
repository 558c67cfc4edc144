pub mod declarations;
pub mod definition;
pub mod introspector;

pub use declarations::generate_declarations;
pub use definition::{sanitize_accessor_name, ColumnDefinition, ColumnType, TableDefinition, TableDefinitionNames};
pub use introspector::{table_names, validate_schema, SchemaDefinition, SchemaError};
