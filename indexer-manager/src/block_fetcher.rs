use anyhow::Context;
use async_trait::async_trait;
use indexer_runtime::{Block, BlockFetcher};
use serde_json::Value;

/// Loads streamer messages from a block server at `<base_url>/<height>`.
#[derive(Clone, Debug)]
pub struct HttpBlockFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBlockFetcher {
    pub fn new(base_url: &str) -> Self {
        HttpBlockFetcher {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn block_url(&self, block_height: u64) -> String {
        format!("{}/{}", self.base_url, block_height)
    }
}

#[async_trait]
impl BlockFetcher for HttpBlockFetcher {
    async fn fetch(&self, block_height: u64) -> anyhow::Result<Block> {
        let response = self
            .client
            .get(self.block_url(block_height))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Block server refused block {}", block_height))?;
        let streamer_message: Value = response.json().await?;
        Ok(Block::new(block_height, streamer_message))
    }
}
