use async_trait::async_trait;
use hasura_client::models::RunSqlResponse;
use hasura_client::{ConnectionParameters, ForeignKey, HasuraError, Metadata, MetadataClient, PermissionType};
use indexer_common::{IndexerConfig, IndexerStatus, LogEntry};
use indexer_storage_postgres::{IndexerMetaFactory, IndexerMetaStore, PgExecutor, StoreError, TenantConnector};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn unsupported<T>(call: &str) -> Result<T, HasuraError> {
    Err(HasuraError::SourceNotFound(format!("{} is not supported here", call)))
}

/// Answers GraphQL calls with a fixed payload and records them. With a
/// `delay`, answers only after sleeping and counts the calls that got there.
#[derive(Default)]
pub struct StaticMetadataClient {
    pub graphql_calls: Mutex<Vec<(String, Option<Value>, Option<String>)>>,
    pub delay: Option<Duration>,
    pub completed: AtomicUsize,
}

#[async_trait]
impl MetadataClient for StaticMetadataClient {
    async fn export_metadata(&self) -> Result<Metadata, HasuraError> {
        Ok(Metadata::default())
    }

    async fn execute_sql(&self, _: &str, _: &str, _: bool) -> Result<RunSqlResponse, HasuraError> {
        unsupported("execute_sql")
    }

    async fn execute_sql_on_schema(&self, _: &str, _: &str, _: &str) -> Result<(), HasuraError> {
        unsupported("execute_sql_on_schema")
    }

    async fn does_schema_exist(&self, _: &str, _: &str) -> Result<bool, HasuraError> {
        Ok(false)
    }

    async fn get_table_names(&self, _: &str, _: &str) -> Result<Vec<String>, HasuraError> {
        Ok(Vec::new())
    }

    async fn get_schemas_owned_by(&self, _: &str, _: &str) -> Result<Vec<String>, HasuraError> {
        Ok(Vec::new())
    }

    async fn get_foreign_keys(&self, _: &str, _: &str) -> Result<Vec<ForeignKey>, HasuraError> {
        Ok(Vec::new())
    }

    async fn create_schema(&self, _: &str, _: &str) -> Result<(), HasuraError> {
        unsupported("create_schema")
    }

    async fn drop_schema(&self, _: &str, _: &str) -> Result<(), HasuraError> {
        unsupported("drop_schema")
    }

    async fn track_tables(&self, _: &str, _: &str, _: &[String]) -> Result<(), HasuraError> {
        unsupported("track_tables")
    }

    async fn create_relationships(&self, _: &str, _: &str, _: &[ForeignKey]) -> Result<(), HasuraError> {
        unsupported("create_relationships")
    }

    async fn add_permissions_to_tables(
        &self,
        _: &str,
        _: &str,
        _: &[String],
        _: &str,
        _: &[PermissionType],
    ) -> Result<(), HasuraError> {
        unsupported("add_permissions_to_tables")
    }

    async fn add_datasource(&self, _: &str, _: &str, _: &str) -> Result<(), HasuraError> {
        unsupported("add_datasource")
    }

    async fn drop_datasource(&self, _: &str) -> Result<(), HasuraError> {
        unsupported("drop_datasource")
    }

    async fn get_db_connection_parameters(&self, _: &str) -> Result<ConnectionParameters, HasuraError> {
        unsupported("get_db_connection_parameters")
    }

    async fn execute_graphql(
        &self,
        query: &str,
        variables: Option<Value>,
        role: Option<&str>,
    ) -> Result<Value, HasuraError> {
        self.graphql_calls.lock().unwrap().push((
            query.to_string(),
            variables,
            role.map(str::to_string),
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if query.contains("broken") {
            return Err(HasuraError::Graphql {
                status: 200,
                errors: "field 'broken' not found".to_string(),
            });
        }
        Ok(json!({ "posts": [{ "id": 1 }] }))
    }
}

/// Records DML and answers every query with `rows`.
#[derive(Default)]
pub struct RecordingExecutor {
    pub queries: Mutex<Vec<(String, Value)>>,
    pub rows: Vec<Value>,
}

impl PgExecutor for RecordingExecutor {
    fn query(&self, sql: &str, param: &Value) -> Result<Vec<Value>, StoreError> {
        self.queries
            .lock()
            .unwrap()
            .push((sql.to_string(), param.clone()));
        Ok(self.rows.clone())
    }

    fn execute(&self, _: &str, _: Option<&Value>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

pub struct StaticConnector(pub Arc<RecordingExecutor>);

#[async_trait]
impl TenantConnector for StaticConnector {
    async fn connect(&self, _: &IndexerConfig) -> anyhow::Result<Arc<dyn PgExecutor>> {
        Ok(self.0.clone())
    }
}

/// Fails every connection attempt.
pub struct NoopConnector;

#[async_trait]
impl TenantConnector for NoopConnector {
    async fn connect(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn PgExecutor>> {
        Err(anyhow::anyhow!("no database for {}", config))
    }
}

#[derive(Default)]
pub struct MemoryMeta {
    pub logs: Mutex<Vec<LogEntry>>,
    pub statuses: Mutex<Vec<IndexerStatus>>,
    pub block_heights: Mutex<Vec<u64>>,
    pub fail_log_writes: bool,
}

#[async_trait]
impl IndexerMetaStore for MemoryMeta {
    async fn write_logs(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if self.fail_log_writes {
            return Err(StoreError::InvalidInput("logs table is gone".to_string()));
        }
        self.logs.lock().unwrap().extend(entries);
        Ok(())
    }

    async fn set_status(&self, status: IndexerStatus) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }

    async fn update_block_height(&self, block_height: u64) -> Result<(), StoreError> {
        self.block_heights.lock().unwrap().push(block_height);
        Ok(())
    }
}

pub struct MemoryMetaFactory(pub Arc<MemoryMeta>);

#[async_trait]
impl IndexerMetaFactory for MemoryMetaFactory {
    async fn create(&self, _: &IndexerConfig) -> anyhow::Result<Arc<dyn IndexerMetaStore>> {
        Ok(self.0.clone())
    }
}
