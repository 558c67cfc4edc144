use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetadataResource {
    #[serde(rename = "resource_version", default)]
    pub version: i64,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Metadata {
    pub version: i32,
    #[serde(default)]
    pub sources: Vec<MetaSource>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetaSource {
    #[serde(default)]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TableMetadata {
    pub table: MetaTable,
    #[serde(default)]
    pub select_permissions: Vec<RolePermission>,
    #[serde(default)]
    pub insert_permissions: Vec<RolePermission>,
    #[serde(default)]
    pub update_permissions: Vec<RolePermission>,
    #[serde(default)]
    pub delete_permissions: Vec<RolePermission>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetaTable {
    pub name: String,
    pub schema: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RolePermission {
    pub role: String,
    #[serde(default)]
    pub permission: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionType {
    Select,
    Insert,
    Update,
    Delete,
}

pub const ALL_PERMISSIONS: [PermissionType; 4] = [
    PermissionType::Select,
    PermissionType::Insert,
    PermissionType::Update,
    PermissionType::Delete,
];

impl PermissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionType::Select => "select",
            PermissionType::Insert => "insert",
            PermissionType::Update => "update",
            PermissionType::Delete => "delete",
        }
    }
}

impl MetaSource {
    pub fn filter(&mut self, schema: &str) -> &Self {
        self.tables.retain(|table| table.table.schema.eq(schema));
        self
    }

    pub fn tables_in_schema<'a>(&'a self, schema: &'a str) -> impl Iterator<Item = &'a TableMetadata> {
        self.tables
            .iter()
            .filter(move |table| table.table.schema == schema)
    }
}

impl Metadata {
    pub fn filter(&mut self, schema: &str) -> &Self {
        self.sources.iter_mut().for_each(|source| {
            source.filter(schema);
        });
        self
    }

    pub fn source(&self, name: &str) -> Option<&MetaSource> {
        self.sources.iter().find(|source| source.name == name)
    }
}

impl TableMetadata {
    fn permissions(&self, permission: PermissionType) -> &[RolePermission] {
        match permission {
            PermissionType::Select => &self.select_permissions,
            PermissionType::Insert => &self.insert_permissions,
            PermissionType::Update => &self.update_permissions,
            PermissionType::Delete => &self.delete_permissions,
        }
    }

    pub fn has_permissions(&self, role: &str, permissions: &[PermissionType]) -> bool {
        permissions.iter().all(|permission| {
            self.permissions(*permission)
                .iter()
                .any(|granted| granted.role == role)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl ConnectionParameters {
    pub fn to_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    pub fn with_database(&self, database: &str) -> Self {
        ConnectionParameters {
            database: database.to_string(),
            ..self.clone()
        }
    }
}

/// Raw answer of a `run_sql` call. Tuple results carry the column names as
/// the first row.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RunSqlResponse {
    #[serde(default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Option<Vec<Vec<Value>>>,
}

impl RunSqlResponse {
    /// Rows without the header row.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.result
            .as_ref()
            .map(|rows| rows.iter().skip(1).cloned().collect())
            .unwrap_or_default()
    }

    /// First column of every row, as text.
    pub fn first_column(&self) -> Vec<String> {
        self.rows()
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ForeignKey {
    pub table_name: String,
    pub column_names: Vec<String>,
    pub foreign_table_name: String,
    pub foreign_column_names: Vec<String>,
}
