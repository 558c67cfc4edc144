use crate::metrics;
use crate::redis_client::StreamClient;
use crate::worker::{IndexerFactory, StreamWorker, WorkerOptions};
use indexer_common::consts::COMPONENT_NAME;
use indexer_runtime::BlockFetcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const STREAM_KEY_SUFFIX: &str = ":block_stream";

/// Label the workers use for a stream key, `account/function`.
pub fn indexer_name(stream_key: &str) -> &str {
    stream_key.strip_suffix(STREAM_KEY_SUFFIX).unwrap_or(stream_key)
}

/// Keeps one worker task per key in the `streams` set.
pub struct StreamManager {
    client: Arc<dyn StreamClient>,
    factory: Arc<dyn IndexerFactory>,
    fetcher: Option<Arc<dyn BlockFetcher>>,
    options: WorkerOptions,
    workers: HashMap<String, JoinHandle<()>>,
}

impl StreamManager {
    pub fn new(client: Arc<dyn StreamClient>, factory: Arc<dyn IndexerFactory>, options: WorkerOptions) -> Self {
        StreamManager {
            client,
            factory,
            fetcher: None,
            options,
            workers: HashMap::new(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Option<Arc<dyn BlockFetcher>>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.workers.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn spawn(&mut self, key: &str) {
        let mut worker = StreamWorker::new(key, self.client.clone(), self.factory.clone())
            .with_options(self.options.clone());
        if let Some(fetcher) = &self.fetcher {
            worker = worker.with_fetcher(fetcher.clone());
        }
        self.workers.insert(key.to_string(), tokio::spawn(worker.run()));
    }

    /// Starts workers for new keys, restarts finished ones and stops those
    /// whose key left the set.
    pub async fn sync(&mut self) -> anyhow::Result<()> {
        let keys: HashSet<String> = self.client.stream_keys().await?.into_iter().collect();

        let removed: Vec<String> = self
            .workers
            .keys()
            .filter(|key| !keys.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(handle) = self.workers.remove(&key) {
                log::info!("{} Stopping worker for {}", *COMPONENT_NAME, key);
                handle.abort();
            }
            metrics::remove_indexer(indexer_name(&key));
        }

        for key in keys {
            match self.workers.get(&key) {
                Some(handle) if !handle.is_finished() => {}
                Some(_) => {
                    log::warn!("{} Worker for {} exited, restarting", *COMPONENT_NAME, key);
                    self.spawn(&key);
                }
                None => {
                    log::info!("{} Starting stream {}", *COMPONENT_NAME, key);
                    self.spawn(&key);
                }
            }
        }
        Ok(())
    }

    pub async fn run(mut self, interval: Duration) {
        loop {
            if let Err(err) = self.sync().await {
                log::error!("{} Failed to sync streams: {:#}", *COMPONENT_NAME, err);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        for handle in self.workers.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::{MemoryStream, RecordingFactory};

    #[test]
    fn it_works_on_indexer_names() {
        assert_eq!("morgs.near/feed", indexer_name("morgs.near/feed:block_stream"));
        assert_eq!("custom", indexer_name("custom"));
    }

    #[tokio::test]
    async fn it_works_on_sync() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        *stream.keys.lock().unwrap() = vec!["a.near/one:block_stream".to_string(), "b.near/two:block_stream".to_string()];
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = StreamManager::new(stream.clone(), factory, WorkerOptions::default());

        manager.sync().await.unwrap();
        assert_eq!(
            vec!["a.near/one:block_stream", "b.near/two:block_stream"],
            manager.active_keys()
        );

        *stream.keys.lock().unwrap() = vec!["b.near/two:block_stream".to_string()];
        manager.sync().await.unwrap();
        assert_eq!(vec!["b.near/two:block_stream"], manager.active_keys());

        stream.keys.lock().unwrap().clear();
        manager.sync().await.unwrap();
        assert!(manager.active_keys().is_empty());
    }
}
