use serde::Serialize;
use std::collections::HashMap;

const SERIAL_TYPES: [&str; 6] = [
    "serial",
    "serial2",
    "serial4",
    "serial8",
    "smallserial",
    "bigserial",
];

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDefinition {
    /// Name as Postgres stores it.
    pub name: String,
    /// Name as written in the schema, quotes included.
    pub original_name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub has_default: bool,
}

impl ColumnDefinition {
    pub fn nullable(&self) -> bool {
        !(self.primary_key || self.not_null)
    }

    pub fn is_serial(&self) -> bool {
        SERIAL_TYPES.contains(&self.data_type.to_lowercase().as_str())
    }

    /// Whether an insert has to supply a value for the column.
    pub fn required(&self) -> bool {
        !(self.has_default || self.is_serial() || self.nullable())
    }

    pub fn ts_type(&self) -> &'static str {
        let data_type = self.data_type.to_lowercase();
        if data_type.starts_with("bool") {
            "boolean"
        } else if data_type.starts_with("json") {
            "any"
        } else if data_type.contains("int")
            || data_type.contains("serial")
            || data_type.starts_with("numeric")
            || data_type.starts_with("decimal")
            || data_type.starts_with("real")
            || data_type.starts_with("double")
            || data_type.starts_with("float")
        {
            "number"
        } else {
            "string"
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub original_name: String,
    /// PascalCase name the table is reachable under from indexer code.
    pub accessor_name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDefinition> {
        self.columns.iter_mut().find(|column| column.name == name)
    }

    pub fn names(&self) -> TableDefinitionNames {
        TableDefinitionNames {
            original_table_name: self.original_name.clone(),
            original_column_names: self
                .columns
                .iter()
                .map(|column| (column.name.clone(), column.original_name.clone()))
                .collect(),
        }
    }
}

/// Literal spelling of a table and its columns, keyed by the names Postgres
/// stores.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableDefinitionNames {
    pub original_table_name: String,
    pub original_column_names: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnType {
    #[serde(rename = "type")]
    pub ts_type: String,
    pub nullable: bool,
    pub required: bool,
}

impl From<&ColumnDefinition> for ColumnType {
    fn from(column: &ColumnDefinition) -> Self {
        ColumnType {
            ts_type: column.ts_type().to_string(),
            nullable: column.nullable(),
            required: column.required(),
        }
    }
}

/// Turns a table name into the identifier indexer code uses for it:
/// `my_table` and `"My Table"` both become `MyTable`.
pub fn sanitize_accessor_name(name: &str) -> String {
    let mut accessor = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if upper_next {
                accessor.push(c.to_ascii_uppercase());
            } else {
                accessor.push(c);
            }
            upper_next = false;
        } else {
            upper_next = true;
        }
    }
    if accessor.starts_with(|c: char| c.is_ascii_digit()) {
        accessor.insert(0, '_');
    }
    accessor
}
