use crate::connection::PgExecutor;
use crate::error::StoreError;
use async_trait::async_trait;
use indexer_common::consts::{
    LAST_PROCESSED_BLOCK_HEIGHT_ATTRIBUTE, LOGS_TABLE_NAME, METADATA_TABLE_NAME, STATUS_ATTRIBUTE,
};
use indexer_common::prelude::anyhow;
use indexer_common::util::sql::quote_ident;
use indexer_common::{IndexerConfig, IndexerStatus, LogEntry};
use serde_json::{json, Value};
use std::sync::Arc;

/// Indexer bookkeeping kept inside the tenant schema: the log table and the
/// attribute table holding status and progress.
#[async_trait]
pub trait IndexerMetaStore: Send + Sync {
    async fn write_logs(&self, entries: Vec<LogEntry>) -> Result<(), StoreError>;
    async fn set_status(&self, status: IndexerStatus) -> Result<(), StoreError>;
    async fn update_block_height(&self, block_height: u64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IndexerMetaFactory: Send + Sync {
    async fn create(&self, config: &IndexerConfig) -> anyhow::Result<Arc<dyn IndexerMetaStore>>;
}

pub struct IndexerMeta {
    schema_name: String,
    executor: Arc<dyn PgExecutor>,
}

impl IndexerMeta {
    pub fn new(schema_name: impl Into<String>, executor: Arc<dyn PgExecutor>) -> Self {
        IndexerMeta {
            schema_name: schema_name.into(),
            executor,
        }
    }

    pub fn write_logs_sql(&self) -> String {
        format!(
            "INSERT INTO {}.{} (block_height, date, timestamp, type, level, message) \
             SELECT x.block_height, x.timestamp::date, x.timestamp, x.type, x.level, x.message \
             FROM jsonb_to_recordset($1) AS x(block_height numeric, timestamp timestamp, type text, level text, message text)",
            quote_ident(&self.schema_name),
            LOGS_TABLE_NAME
        )
    }

    pub fn set_attribute_sql(&self) -> String {
        format!(
            "INSERT INTO {}.{} (attribute, value) SELECT $1->>'attribute', $1->>'value' \
             ON CONFLICT (attribute) DO UPDATE SET value = EXCLUDED.value",
            quote_ident(&self.schema_name),
            METADATA_TABLE_NAME
        )
    }

    async fn execute(&self, sql: String, param: Value) -> Result<(), StoreError> {
        let executor = self.executor.clone();
        tokio::task::spawn_blocking(move || executor.execute(&sql, Some(&param)))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
            .map(|_| ())
    }

    async fn set_attribute(&self, attribute: &str, value: String) -> Result<(), StoreError> {
        let param = json!({ "attribute": attribute, "value": value });
        self.execute(self.set_attribute_sql(), param).await
    }
}

#[async_trait]
impl IndexerMetaStore for IndexerMeta {
    async fn write_logs(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let param = serde_json::to_value(&entries)
            .map_err(|err| StoreError::InvalidInput(err.to_string()))?;
        self.execute(self.write_logs_sql(), param).await
    }

    async fn set_status(&self, status: IndexerStatus) -> Result<(), StoreError> {
        self.set_attribute(STATUS_ATTRIBUTE, status.to_string()).await
    }

    async fn update_block_height(&self, block_height: u64) -> Result<(), StoreError> {
        self.set_attribute(LAST_PROCESSED_BLOCK_HEIGHT_ATTRIBUTE, block_height.to_string())
            .await
    }
}
