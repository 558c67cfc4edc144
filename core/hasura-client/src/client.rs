use crate::models::{
    ConnectionParameters, ForeignKey, Metadata, MetadataResource, PermissionType, RunSqlResponse,
};
use async_trait::async_trait;
use http::{Method, Uri};
use indexer_common::util::sql::{quote_ident, quote_literal};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const ADMIN_SECRET_HEADER: &str = "X-Hasura-Admin-Secret";
const ROLE_HEADER: &str = "X-Hasura-Role";
const BACKEND_ONLY_HEADER: &str = "X-Hasura-Use-Backend-Only-Permissions";

#[derive(Debug, Error)]
pub enum HasuraError {
    #[error("invalid hasura endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} responded with status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("Failed to query graphql, http status: {status}, errors: {errors}")]
    Graphql { status: u16, errors: String },
    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("source {0} does not exist in metadata")]
    SourceNotFound(String),
}

/// Everything the runner needs from the metadata/GraphQL layer. Methods
/// that only read are marked as such in their docs; the rest mutate either
/// the metadata or the tenant database.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Read only.
    async fn export_metadata(&self) -> Result<Metadata, HasuraError>;
    async fn execute_sql(
        &self,
        source: &str,
        sql: &str,
        read_only: bool,
    ) -> Result<RunSqlResponse, HasuraError>;
    async fn execute_sql_on_schema(
        &self,
        source: &str,
        schema: &str,
        sql: &str,
    ) -> Result<(), HasuraError>;
    /// Read only.
    async fn does_schema_exist(&self, source: &str, schema: &str) -> Result<bool, HasuraError>;
    /// Read only.
    async fn get_table_names(&self, source: &str, schema: &str)
        -> Result<Vec<String>, HasuraError>;
    /// Read only.
    async fn get_schemas_owned_by(
        &self,
        source: &str,
        owner: &str,
    ) -> Result<Vec<String>, HasuraError>;
    /// Read only.
    async fn get_foreign_keys(
        &self,
        source: &str,
        schema: &str,
    ) -> Result<Vec<ForeignKey>, HasuraError>;
    async fn create_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError>;
    async fn drop_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError>;
    async fn track_tables(
        &self,
        source: &str,
        schema: &str,
        tables: &[String],
    ) -> Result<(), HasuraError>;
    async fn create_relationships(
        &self,
        source: &str,
        schema: &str,
        foreign_keys: &[ForeignKey],
    ) -> Result<(), HasuraError>;
    async fn add_permissions_to_tables(
        &self,
        source: &str,
        schema: &str,
        tables: &[String],
        role: &str,
        permissions: &[PermissionType],
    ) -> Result<(), HasuraError>;
    async fn add_datasource(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
    ) -> Result<(), HasuraError>;
    async fn drop_datasource(&self, database_name: &str) -> Result<(), HasuraError>;
    /// Read only.
    async fn get_db_connection_parameters(
        &self,
        source: &str,
    ) -> Result<ConnectionParameters, HasuraError>;
    /// Runs a GraphQL operation. With a role, the call is made as that role
    /// using the admin secret; without one only backend-only permissions are
    /// requested.
    async fn execute_graphql(
        &self,
        query: &str,
        variables: Option<Value>,
        role: Option<&str>,
    ) -> Result<Value, HasuraError>;

    async fn track_foreign_key_relationships(
        &self,
        source: &str,
        schema: &str,
    ) -> Result<(), HasuraError> {
        let foreign_keys = self.get_foreign_keys(source, schema).await?;
        if foreign_keys.is_empty() {
            return Ok(());
        }
        self.create_relationships(source, schema, &foreign_keys).await
    }
}

#[derive(Clone)]
pub struct HasuraClient {
    base: Arc<Uri>,
    admin_secret: Arc<String>,
    /// Host and port tenants reach their database through; written into
    /// every datasource added by this client.
    pg_host: Arc<String>,
    pg_port: u16,
    client: Arc<Client>,
}

impl HasuraClient {
    pub fn new(
        base: &str,
        admin_secret: &str,
        pg_host: &str,
        pg_port: u16,
    ) -> Result<Self, HasuraError> {
        let base = Uri::from_str(base).map_err(|err| HasuraError::InvalidEndpoint(err.to_string()))?;
        Ok(HasuraClient {
            client: Arc::new(Client::new()),
            base: Arc::new(base),
            admin_secret: Arc::new(admin_secret.to_string()),
            pg_host: Arc::new(pg_host.to_string()),
            pg_port,
        })
    }

    fn build_url(&self, endpoint: &str) -> Result<String, HasuraError> {
        let mut builder = Uri::builder();
        if let Some(schema) = self.base.scheme_str() {
            builder = builder.scheme(schema);
        }
        if let Some(authority) = self.base.authority() {
            builder = builder.authority(authority.clone());
        }
        if endpoint.starts_with('/') {
            builder = builder.path_and_query(endpoint);
        } else {
            builder = builder.path_and_query(format!("/{}", endpoint));
        }
        builder
            .build()
            .map(|uri| uri.to_string())
            .map_err(|err| HasuraError::InvalidEndpoint(err.to_string()))
    }

    fn build_request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder, HasuraError> {
        let url = self.build_url(endpoint)?;
        Ok(self.client.request(method, &url))
    }

    async fn call_hasura_api<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        payload: &T,
    ) -> Result<Value, HasuraError> {
        let response = self
            .build_request(Method::POST, endpoint)?
            .header(ADMIN_SECRET_HEADER, self.admin_secret.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|source| HasuraError::Http {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| HasuraError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        if !status.is_success() {
            return Err(HasuraError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|err| HasuraError::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })
    }

    async fn metadata_request(&self, payload: Value) -> Result<Value, HasuraError> {
        self.call_hasura_api("/v1/metadata", &payload).await
    }

    async fn bulk_metadata_request(&self, requests: Vec<Value>) -> Result<(), HasuraError> {
        if requests.is_empty() {
            return Ok(());
        }
        self.metadata_request(json!({ "type": "bulk", "args": requests }))
            .await
            .map(|_| ())
    }

    fn decode<T: serde::de::DeserializeOwned>(
        endpoint: &str,
        value: Value,
    ) -> Result<T, HasuraError> {
        serde_json::from_value(value).map_err(|err| HasuraError::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })
    }
}

pub fn permission_payload(
    source: &str,
    schema: &str,
    table: &str,
    role: &str,
    permission: PermissionType,
) -> Value {
    let mut definition = json!({
        "columns": "*",
        "check": {},
        "computed_fields": [],
        "filter": {},
    });
    match permission {
        PermissionType::Select => definition["allow_aggregations"] = json!(true),
        _ => definition["backend_only"] = json!(true),
    }
    json!({
        "type": format!("pg_create_{}_permission", permission.as_str()),
        "args": {
            "table": { "name": table, "schema": schema },
            "role": role,
            "source": source,
            "permission": definition,
        }
    })
}

pub fn relationship_payloads(source: &str, schema: &str, foreign_key: &ForeignKey) -> Vec<Value> {
    let columns = foreign_key.column_names.join("_");
    vec![
        json!({
            "type": "pg_create_object_relationship",
            "args": {
                "table": { "name": foreign_key.table_name, "schema": schema },
                "name": format!("{}_by_{}", foreign_key.foreign_table_name, columns),
                "source": source,
                "using": { "foreign_key_constraint_on": foreign_key.column_names },
            }
        }),
        json!({
            "type": "pg_create_array_relationship",
            "args": {
                "table": { "name": foreign_key.foreign_table_name, "schema": schema },
                "name": format!("{}_by_{}", foreign_key.table_name, columns),
                "source": source,
                "using": {
                    "foreign_key_constraint_on": {
                        "table": { "name": foreign_key.table_name, "schema": schema },
                        "columns": foreign_key.column_names,
                    }
                },
            }
        }),
    ]
}

fn foreign_keys_sql(schema: &str) -> String {
    format!(
        r#"SELECT COALESCE(json_agg(fk), '[]'::json) FROM (
  SELECT
    cl.relname AS table_name,
    ARRAY_AGG(col.attname ORDER BY conkey.ord) AS column_names,
    referenced_cl.relname AS foreign_table_name,
    ARRAY_AGG(referenced_col.attname ORDER BY conkey.ord) AS foreign_column_names
  FROM pg_constraint AS con
    JOIN pg_class AS cl ON con.conrelid = cl.oid
    JOIN pg_namespace AS ns ON cl.relnamespace = ns.oid
    JOIN pg_class AS referenced_cl ON con.confrelid = referenced_cl.oid
    JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS conkey(attnum, ord) ON TRUE
    JOIN pg_attribute AS col ON col.attnum = conkey.attnum AND col.attrelid = cl.oid
    JOIN LATERAL unnest(con.confkey) WITH ORDINALITY AS confkey(attnum, ord) ON confkey.ord = conkey.ord
    JOIN pg_attribute AS referenced_col ON referenced_col.attnum = confkey.attnum AND referenced_col.attrelid = referenced_cl.oid
  WHERE ns.nspname = {} AND con.contype = 'f'
  GROUP BY con.conname, cl.relname, referenced_cl.relname
) fk"#,
        quote_literal(schema)
    )
}

#[async_trait]
impl MetadataClient for HasuraClient {
    async fn export_metadata(&self) -> Result<Metadata, HasuraError> {
        let payload = json!({
            "type" : "export_metadata",
            "version" : 2,
            "args" : {}
        });
        let value = self.metadata_request(payload).await?;
        let resource: MetadataResource = Self::decode("/v1/metadata", value)?;
        Ok(resource.metadata)
    }

    async fn execute_sql(
        &self,
        source: &str,
        sql: &str,
        read_only: bool,
    ) -> Result<RunSqlResponse, HasuraError> {
        let payload = json!({
            "type": "run_sql",
            "args": {
                "sql": sql,
                "read_only": read_only,
                "source": source,
                "cascade": !read_only,
            }
        });
        let value = self.call_hasura_api("/v2/query", &payload).await?;
        Self::decode("/v2/query", value)
    }

    async fn execute_sql_on_schema(
        &self,
        source: &str,
        schema: &str,
        sql: &str,
    ) -> Result<(), HasuraError> {
        let sql = format!("SET search_path TO {};\n{}", quote_ident(schema), sql);
        self.execute_sql(source, &sql, false).await.map(|_| ())
    }

    async fn does_schema_exist(&self, source: &str, schema: &str) -> Result<bool, HasuraError> {
        let sql = format!(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name = {}",
            quote_literal(schema)
        );
        let response = self.execute_sql(source, &sql, true).await?;
        Ok(!response.rows().is_empty())
    }

    async fn get_table_names(
        &self,
        source: &str,
        schema: &str,
    ) -> Result<Vec<String>, HasuraError> {
        let sql = format!(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = {} ORDER BY table_name",
            quote_literal(schema)
        );
        Ok(self.execute_sql(source, &sql, true).await?.first_column())
    }

    async fn get_schemas_owned_by(
        &self,
        source: &str,
        owner: &str,
    ) -> Result<Vec<String>, HasuraError> {
        let sql = format!(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_owner = {}",
            quote_literal(owner)
        );
        Ok(self.execute_sql(source, &sql, true).await?.first_column())
    }

    async fn get_foreign_keys(
        &self,
        source: &str,
        schema: &str,
    ) -> Result<Vec<ForeignKey>, HasuraError> {
        let response = self.execute_sql(source, &foreign_keys_sql(schema), true).await?;
        match response.first_column().into_iter().next() {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| HasuraError::Decode {
                endpoint: "/v2/query".to_string(),
                message: err.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn create_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError> {
        let sql = format!("CREATE SCHEMA {}", quote_ident(schema));
        self.execute_sql(source, &sql, false).await.map(|_| ())
    }

    async fn drop_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError> {
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema));
        self.execute_sql(source, &sql, false).await.map(|_| ())
    }

    async fn track_tables(
        &self,
        source: &str,
        schema: &str,
        tables: &[String],
    ) -> Result<(), HasuraError> {
        let requests = tables
            .iter()
            .map(|table| {
                json!({
                    "type": "pg_track_table",
                    "args": {
                        "table": { "name": table, "schema": schema },
                        "source": source,
                    }
                })
            })
            .collect();
        self.bulk_metadata_request(requests).await
    }

    async fn create_relationships(
        &self,
        source: &str,
        schema: &str,
        foreign_keys: &[ForeignKey],
    ) -> Result<(), HasuraError> {
        let requests = foreign_keys
            .iter()
            .flat_map(|foreign_key| relationship_payloads(source, schema, foreign_key))
            .collect();
        self.bulk_metadata_request(requests).await
    }

    async fn add_permissions_to_tables(
        &self,
        source: &str,
        schema: &str,
        tables: &[String],
        role: &str,
        permissions: &[PermissionType],
    ) -> Result<(), HasuraError> {
        let requests = tables
            .iter()
            .flat_map(|table| {
                permissions
                    .iter()
                    .map(move |permission| permission_payload(source, schema, table, role, *permission))
            })
            .collect();
        self.bulk_metadata_request(requests).await
    }

    async fn add_datasource(
        &self,
        user_name: &str,
        password: &str,
        database_name: &str,
    ) -> Result<(), HasuraError> {
        let payload = json!({
            "type": "pg_add_source",
            "args": {
                "name": database_name,
                "configuration": {
                    "connection_info": {
                        "database_url": {
                            "connection_parameters": {
                                "password": password,
                                "database": database_name,
                                "username": user_name,
                                "host": self.pg_host.as_str(),
                                "port": self.pg_port,
                            }
                        }
                    }
                },
                "customization": {
                    "root_fields": { "namespace": database_name },
                    "type_names": { "prefix": format!("{}_", database_name) },
                },
            }
        });
        self.metadata_request(payload).await.map(|_| ())
    }

    async fn drop_datasource(&self, database_name: &str) -> Result<(), HasuraError> {
        let payload = json!({
            "type": "pg_drop_source",
            "args": { "name": database_name, "cascade": true }
        });
        self.metadata_request(payload).await.map(|_| ())
    }

    async fn get_db_connection_parameters(
        &self,
        source: &str,
    ) -> Result<ConnectionParameters, HasuraError> {
        let metadata = self.export_metadata().await?;
        let parameters = metadata
            .source(source)
            .and_then(|source| source.configuration.as_ref())
            .and_then(|configuration| {
                configuration
                    .pointer("/connection_info/database_url/connection_parameters")
                    .cloned()
            })
            .ok_or_else(|| HasuraError::SourceNotFound(source.to_string()))?;
        Self::decode("/v1/metadata", parameters)
    }

    async fn execute_graphql(
        &self,
        query: &str,
        variables: Option<Value>,
        role: Option<&str>,
    ) -> Result<Value, HasuraError> {
        let endpoint = "/v1/graphql";
        let mut request = self
            .build_request(Method::POST, endpoint)?
            .header(BACKEND_ONLY_HEADER, "true");
        if let Some(role) = role {
            request = request
                .header(ROLE_HEADER, role)
                .header(ADMIN_SECRET_HEADER, self.admin_secret.as_str());
        }
        let payload = json!({
            "query": query,
            "variables": variables.unwrap_or_else(|| json!({})),
        });
        let response = request
            .json(&payload)
            .send()
            .await
            .map_err(|source| HasuraError::Http {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.map_err(|source| HasuraError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        graphql_data(status, body)
    }
}

/// Unwraps `data` from a GraphQL response, rejecting non-200 responses and
/// responses that carry `errors`.
pub fn graphql_data(status: u16, mut body: Value) -> Result<Value, HasuraError> {
    let errors = body.get("errors").filter(|errors| !errors.is_null()).cloned();
    if status != 200 || errors.is_some() {
        return Err(HasuraError::Graphql {
            status,
            errors: errors.map(|e| e.to_string()).unwrap_or_default(),
        });
    }
    Ok(body.get_mut("data").map(Value::take).unwrap_or(Value::Null))
}
