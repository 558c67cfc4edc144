use async_trait::async_trait;
use hasura_client::models::RunSqlResponse;
use hasura_client::{ConnectionParameters, ForeignKey, HasuraError, Metadata, MetadataClient, PermissionType};
use indexer_provisioner::ExecutorFactory;
use indexer_storage_postgres::{AdminDatabase, PgExecutor, StoreError};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

fn failure(body: &str) -> HasuraError {
    HasuraError::Status {
        endpoint: "/v2/query".to_string(),
        status: 500,
        body: body.to_string(),
    }
}

/// Table names declared by `CREATE TABLE` statements, good enough for the
/// scripts used in these tests.
fn created_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut rest = sql;
    while let Some(index) = rest.find("CREATE TABLE") {
        rest = &rest[index + "CREATE TABLE".len()..];
        let trimmed = rest.trim_start();
        let trimmed = trimmed.strip_prefix("IF NOT EXISTS").unwrap_or(trimmed).trim_start();
        let name: String = trimmed
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '(')
            .collect();
        let name = name.trim_matches('"');
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            tables.push(name.to_string());
        }
    }
    tables
}

#[derive(Default)]
pub struct Cluster {
    /// database -> password
    pub sources: BTreeMap<String, String>,
    /// database -> schemas
    pub schemas: BTreeMap<String, BTreeSet<String>>,
    /// (database, schema) -> tables
    pub tables: BTreeMap<(String, String), BTreeSet<String>>,
    pub tracked: BTreeSet<(String, String, String)>,
    pub permitted: BTreeSet<(String, String, String, String)>,
    pub relationships: Vec<(String, String)>,
    /// Every call that changes something, in order.
    pub mutations: Vec<String>,
    pub failing_permission_calls: u32,
    pub failing_datasource_calls: u32,
    pub failing_user_scripts: bool,
}

#[derive(Clone, Default)]
pub struct MockMetadataClient {
    pub cluster: Arc<Mutex<Cluster>>,
}

impl MockMetadataClient {
    pub fn mutations(&self) -> Vec<String> {
        self.cluster.lock().unwrap().mutations.clone()
    }

    fn record(&self, mutation: String) {
        self.cluster.lock().unwrap().mutations.push(mutation);
    }
}

#[async_trait]
impl MetadataClient for MockMetadataClient {
    async fn export_metadata(&self) -> Result<Metadata, HasuraError> {
        let cluster = self.cluster.lock().unwrap();
        let sources: Vec<Value> = cluster
            .sources
            .keys()
            .map(|database| {
                let tables: Vec<Value> = cluster
                    .tracked
                    .iter()
                    .filter(|(db, _, _)| db == database)
                    .map(|(db, schema, table)| {
                        let permissions = |kind: &str| -> Vec<Value> {
                            cluster
                                .permitted
                                .iter()
                                .filter(|(d, s, t, k)| d == db && s == schema && t == table && k == kind)
                                .map(|_| json!({ "role": db, "permission": {} }))
                                .collect()
                        };
                        json!({
                            "table": { "name": table, "schema": schema },
                            "select_permissions": permissions("select"),
                            "insert_permissions": permissions("insert"),
                            "update_permissions": permissions("update"),
                            "delete_permissions": permissions("delete"),
                        })
                    })
                    .collect();
                json!({ "name": database, "kind": "postgres", "tables": tables })
            })
            .collect();
        Ok(serde_json::from_value(json!({ "version": 3, "sources": sources })).unwrap())
    }

    async fn execute_sql(
        &self,
        _source: &str,
        _sql: &str,
        _read_only: bool,
    ) -> Result<RunSqlResponse, HasuraError> {
        Ok(RunSqlResponse::default())
    }

    async fn execute_sql_on_schema(
        &self,
        source: &str,
        schema: &str,
        sql: &str,
    ) -> Result<(), HasuraError> {
        let system = sql.contains("sys_metadata") || sql.contains("sys_logs");
        let mut cluster = self.cluster.lock().unwrap();
        cluster
            .mutations
            .push(format!("execute_sql_on_schema {}.{}", source, schema));
        if !system && cluster.failing_user_scripts {
            return Err(failure("syntax error at or near \"CREAT\""));
        }
        let tables = cluster
            .tables
            .entry((source.to_string(), schema.to_string()))
            .or_default();
        for table in created_tables(sql) {
            tables.insert(table);
        }
        Ok(())
    }

    async fn does_schema_exist(&self, source: &str, schema: &str) -> Result<bool, HasuraError> {
        let cluster = self.cluster.lock().unwrap();
        Ok(cluster
            .schemas
            .get(source)
            .map(|schemas| schemas.contains(schema))
            .unwrap_or(false))
    }

    async fn get_table_names(&self, source: &str, schema: &str) -> Result<Vec<String>, HasuraError> {
        let cluster = self.cluster.lock().unwrap();
        Ok(cluster
            .tables
            .get(&(source.to_string(), schema.to_string()))
            .map(|tables| tables.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_schemas_owned_by(&self, source: &str, _owner: &str) -> Result<Vec<String>, HasuraError> {
        let cluster = self.cluster.lock().unwrap();
        Ok(cluster
            .schemas
            .get(source)
            .map(|schemas| schemas.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_foreign_keys(&self, _source: &str, _schema: &str) -> Result<Vec<ForeignKey>, HasuraError> {
        Ok(vec![ForeignKey {
            table_name: "comments".to_string(),
            column_names: vec!["post_id".to_string()],
            foreign_table_name: "posts".to_string(),
            foreign_column_names: vec!["id".to_string()],
        }])
    }

    async fn create_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError> {
        self.record(format!("create_schema {}.{}", source, schema));
        let mut cluster = self.cluster.lock().unwrap();
        cluster
            .schemas
            .entry(source.to_string())
            .or_default()
            .insert(schema.to_string());
        Ok(())
    }

    async fn drop_schema(&self, source: &str, schema: &str) -> Result<(), HasuraError> {
        self.record(format!("drop_schema {}.{}", source, schema));
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(schemas) = cluster.schemas.get_mut(source) {
            schemas.remove(schema);
        }
        cluster.tables.remove(&(source.to_string(), schema.to_string()));
        cluster.tracked.retain(|(d, s, _)| !(d == source && s == schema));
        cluster.permitted.retain(|(d, s, _, _)| !(d == source && s == schema));
        Ok(())
    }

    async fn track_tables(&self, source: &str, schema: &str, tables: &[String]) -> Result<(), HasuraError> {
        self.record(format!("track_tables {}", tables.join(",")));
        let mut cluster = self.cluster.lock().unwrap();
        for table in tables {
            cluster
                .tracked
                .insert((source.to_string(), schema.to_string(), table.clone()));
        }
        Ok(())
    }

    async fn create_relationships(
        &self,
        _source: &str,
        schema: &str,
        foreign_keys: &[ForeignKey],
    ) -> Result<(), HasuraError> {
        self.record(format!("create_relationships {}", schema));
        let mut cluster = self.cluster.lock().unwrap();
        for foreign_key in foreign_keys {
            cluster
                .relationships
                .push((foreign_key.table_name.clone(), foreign_key.foreign_table_name.clone()));
        }
        Ok(())
    }

    async fn add_permissions_to_tables(
        &self,
        source: &str,
        schema: &str,
        tables: &[String],
        _role: &str,
        permissions: &[PermissionType],
    ) -> Result<(), HasuraError> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster
            .mutations
            .push(format!("add_permissions {}", tables.join(",")));
        if cluster.failing_permission_calls > 0 {
            cluster.failing_permission_calls -= 1;
            return Err(failure("metadata is locked"));
        }
        for table in tables {
            for permission in permissions {
                cluster.permitted.insert((
                    source.to_string(),
                    schema.to_string(),
                    table.clone(),
                    permission.as_str().to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn add_datasource(&self, _user_name: &str, password: &str, database_name: &str) -> Result<(), HasuraError> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.mutations.push(format!("add_datasource {}", database_name));
        if cluster.failing_datasource_calls > 0 {
            cluster.failing_datasource_calls -= 1;
            return Err(failure("connection refused"));
        }
        cluster
            .sources
            .insert(database_name.to_string(), password.to_string());
        Ok(())
    }

    async fn drop_datasource(&self, database_name: &str) -> Result<(), HasuraError> {
        self.record(format!("drop_datasource {}", database_name));
        let mut cluster = self.cluster.lock().unwrap();
        cluster.sources.remove(database_name);
        cluster.schemas.remove(database_name);
        Ok(())
    }

    async fn get_db_connection_parameters(&self, source: &str) -> Result<ConnectionParameters, HasuraError> {
        let cluster = self.cluster.lock().unwrap();
        let password = cluster
            .sources
            .get(source)
            .cloned()
            .ok_or_else(|| HasuraError::SourceNotFound(source.to_string()))?;
        Ok(ConnectionParameters {
            host: "postgres".to_string(),
            port: 5432,
            username: source.to_string(),
            password,
            database: source.to_string(),
        })
    }

    async fn execute_graphql(
        &self,
        _query: &str,
        _variables: Option<Value>,
        _role: Option<&str>,
    ) -> Result<Value, HasuraError> {
        Ok(Value::Null)
    }
}

/// Keeps roles and databases the way the cluster would, so repeating a
/// creation has to be harmless.
#[derive(Clone, Default)]
pub struct MockAdminDatabase {
    pub calls: Arc<Mutex<Vec<String>>>,
    /// role -> password
    pub roles: Arc<Mutex<BTreeMap<String, String>>>,
    pub databases: Arc<Mutex<BTreeSet<String>>>,
}

impl MockAdminDatabase {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn password_of(&self, user_name: &str) -> Option<String> {
        self.roles.lock().unwrap().get(user_name).cloned()
    }

    fn record(&self, call: String) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl AdminDatabase for MockAdminDatabase {
    async fn create_user_db(&self, user_name: &str, password: &str, database_name: &str) -> Result<(), StoreError> {
        self.roles
            .lock()
            .unwrap()
            .insert(user_name.to_string(), password.to_string());
        self.databases.lock().unwrap().insert(database_name.to_string());
        self.record(format!("create_user_db {} {}", user_name, database_name))
    }

    async fn drop_database(&self, database_name: &str) -> Result<(), StoreError> {
        self.databases.lock().unwrap().remove(database_name);
        self.record(format!("drop_database {}", database_name))
    }

    async fn drop_role(&self, user_name: &str) -> Result<(), StoreError> {
        self.roles.lock().unwrap().remove(user_name);
        self.record(format!("drop_role {}", user_name))
    }

    async fn grant_cron_access(&self, user_name: &str) -> Result<(), StoreError> {
        self.record(format!("grant_cron_access {}", user_name))
    }

    async fn revoke_cron_access(&self, user_name: &str) -> Result<(), StoreError> {
        self.record(format!("revoke_cron_access {}", user_name))
    }

    async fn schedule_log_partition_jobs(
        &self,
        _user_name: &str,
        _password: &str,
        _database_name: &str,
        _schema_name: &str,
        job_names: (String, String),
    ) -> Result<(), StoreError> {
        self.record(format!("schedule {} {}", job_names.0, job_names.1))
    }

    async fn unschedule_jobs(&self, job_names: Vec<String>) -> Result<(), StoreError> {
        self.record(format!("unschedule {}", job_names.join(" ")))
    }
}

/// Records statements sent to tenant databases instead of running them.
#[derive(Clone, Default)]
pub struct RecordingExecutors {
    pub urls: Arc<Mutex<Vec<String>>>,
    pub statements: Arc<Mutex<Vec<(String, Option<Value>)>>>,
}

struct RecordingExecutor {
    statements: Arc<Mutex<Vec<(String, Option<Value>)>>>,
}

impl PgExecutor for RecordingExecutor {
    fn query(&self, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), Some(param.clone())));
        Ok(Vec::new())
    }

    fn execute(&self, sql: &str, param: Option<&Value>) -> Result<usize, StoreError> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), param.cloned()));
        Ok(1)
    }
}

impl ExecutorFactory for RecordingExecutors {
    fn open(&self, url: &str) -> Arc<dyn PgExecutor> {
        self.urls.lock().unwrap().push(url.to_string());
        Arc::new(RecordingExecutor {
            statements: self.statements.clone(),
        })
    }
}
