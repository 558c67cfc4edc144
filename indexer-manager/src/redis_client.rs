//! Stream and cursor storage for the runner.
//!
//! Layout:
//! - `streams`: set of active stream keys
//! - `<key>`: stream of blocks, entries carry `block_height` and optionally
//!   `streamer_message`
//! - `<key>:storage`: JSON storage record of the indexer
//! - `<key>:last_id`: id of the last fully processed entry
use anyhow::Context;
use async_trait::async_trait;
use indexer_common::{IndexerConfig, LogLevel};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STREAMS_SET_KEY: &str = "streams";

pub fn storage_key(stream_key: &str) -> String {
    format!("{}:storage", stream_key)
}

pub fn last_id_key(stream_key: &str) -> String {
    format!("{}:last_id", stream_key)
}

/// What the registry stores for an indexer next to its stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub account_id: String,
    pub function_name: String,
    pub code: String,
    pub schema: String,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default)]
    pub version: Option<i64>,
}

impl StorageRecord {
    pub fn to_config(&self, stream_key: &str) -> IndexerConfig {
        let mut config = IndexerConfig::new(
            self.account_id.as_str(),
            self.function_name.as_str(),
            self.code.as_str(),
            self.schema.as_str(),
        )
        .with_redis_stream_key(stream_key);
        if let Some(level) = self.log_level {
            config = config.with_log_level(level);
        }
        config.version = self.version.unwrap_or_default();
        config
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub block_height: u64,
    pub streamer_message: Option<Value>,
}

impl StreamMessage {
    fn from_stream_id(entry: &StreamId) -> anyhow::Result<Self> {
        let block_height = entry
            .get::<String>("block_height")
            .and_then(|height| height.parse().ok())
            .with_context(|| format!("Stream entry {} has no valid block_height", entry.id))?;
        let streamer_message = match entry.get::<String>("streamer_message") {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("Stream entry {} has an invalid streamer_message", entry.id))?,
            ),
            None => None,
        };
        Ok(StreamMessage {
            id: entry.id.clone(),
            block_height,
            streamer_message,
        })
    }
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn stream_keys(&self) -> anyhow::Result<Vec<String>>;
    async fn storage_record(&self, stream_key: &str) -> anyhow::Result<Option<StorageRecord>>;
    /// First entry after the cursor, if any.
    async fn next_message(&self, stream_key: &str) -> anyhow::Result<Option<StreamMessage>>;
    /// Moves the cursor to `id` and deletes the entry.
    async fn acknowledge(&self, stream_key: &str, id: &str) -> anyhow::Result<()>;
    async fn unprocessed_count(&self, stream_key: &str) -> anyhow::Result<u64>;
}

#[derive(Clone)]
pub struct RedisStreamClient {
    connection: MultiplexedConnection,
}

impl RedisStreamClient {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("Invalid redis connection string")?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .context("Failed to connect to redis")?;
        Ok(RedisStreamClient { connection })
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn stream_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let keys: Vec<String> = connection.smembers(STREAMS_SET_KEY).await?;
        Ok(keys)
    }

    async fn storage_record(&self, stream_key: &str) -> anyhow::Result<Option<StorageRecord>> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(storage_key(stream_key)).await?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).with_context(|| format!("Invalid storage record of {}", stream_key))?,
            )),
            None => Ok(None),
        }
    }

    async fn next_message(&self, stream_key: &str) -> anyhow::Result<Option<StreamMessage>> {
        let mut connection = self.connection.clone();
        let last_id: Option<String> = connection.get(last_id_key(stream_key)).await?;
        let start = match last_id {
            Some(id) => format!("({}", id),
            None => "-".to_string(),
        };
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream_key)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut connection)
            .await?;
        reply
            .ids
            .first()
            .map(StreamMessage::from_stream_id)
            .transpose()
    }

    async fn acknowledge(&self, stream_key: &str, id: &str) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .set(last_id_key(stream_key), id)
            .ignore()
            .xdel(stream_key, &[id])
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn unprocessed_count(&self, stream_key: &str) -> anyhow::Result<u64> {
        let mut connection = self.connection.clone();
        let count: u64 = connection.xlen(stream_key).await?;
        Ok(count)
    }
}
