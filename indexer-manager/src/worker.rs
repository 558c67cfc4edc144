use crate::metrics;
use crate::redis_client::{StreamClient, StreamMessage};
use anyhow::Context as _;
use async_trait::async_trait;
use indexer_common::consts::COMPONENT_NAME;
use indexer_common::prelude::RetryConfig;
use indexer_common::IndexerConfig;
use indexer_runtime::{Block, BlockFetcher, ContextBuilder, Indexer, IndexerOptions, ProvisionerApi};
use indexer_storage_postgres::IndexerMetaFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};

/// Cap on the backoff exponent, 2^6 times the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// What happens to the cursor when a block fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OnFailure {
    /// Keep the message and retry it with backoff.
    Retry,
    /// Acknowledge the message and move on.
    Skip,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Retry
    }
}

#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&mut self, block: &Block) -> anyhow::Result<()>;
}

#[async_trait]
impl BlockExecutor for Indexer {
    async fn execute(&mut self, block: &Block) -> anyhow::Result<()> {
        Indexer::execute(self, block).await
    }
}

pub trait IndexerFactory: Send + Sync {
    fn create(&self, config: IndexerConfig) -> Box<dyn BlockExecutor>;
}

/// Builds runtime indexers sharing one provisioner and context builder.
pub struct RuntimeIndexerFactory {
    provisioner: Arc<dyn ProvisionerApi>,
    meta_factory: Arc<dyn IndexerMetaFactory>,
    context_builder: ContextBuilder,
    options: IndexerOptions,
}

impl RuntimeIndexerFactory {
    pub fn new(
        provisioner: Arc<dyn ProvisionerApi>,
        meta_factory: Arc<dyn IndexerMetaFactory>,
        context_builder: ContextBuilder,
        options: IndexerOptions,
    ) -> Self {
        RuntimeIndexerFactory {
            provisioner,
            meta_factory,
            context_builder,
            options,
        }
    }
}

impl IndexerFactory for RuntimeIndexerFactory {
    fn create(&self, config: IndexerConfig) -> Box<dyn BlockExecutor> {
        Box::new(
            Indexer::new(
                config,
                self.provisioner.clone(),
                self.meta_factory.clone(),
                self.context_builder.clone(),
            )
            .with_options(self.options.clone()),
        )
    }
}

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub on_failure: OnFailure,
    pub backoff: RetryConfig,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            poll_interval: Duration::from_millis(100),
            on_failure: OnFailure::default(),
            backoff: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing after the cursor.
    Idle,
    Processed(u64),
    /// Failed and acknowledged anyway.
    Skipped(u64),
    /// Failed and left in the stream.
    Failed(u64),
}

/// Consumes one block stream in order.
pub struct StreamWorker {
    key: String,
    client: Arc<dyn StreamClient>,
    factory: Arc<dyn IndexerFactory>,
    fetcher: Option<Arc<dyn BlockFetcher>>,
    options: WorkerOptions,
    current: Option<(IndexerConfig, Box<dyn BlockExecutor>)>,
    failures: u32,
}

impl StreamWorker {
    pub fn new(key: impl Into<String>, client: Arc<dyn StreamClient>, factory: Arc<dyn IndexerFactory>) -> Self {
        StreamWorker {
            key: key.into(),
            client,
            factory,
            fetcher: None,
            options: WorkerOptions::default(),
            current: None,
            failures: 0,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn BlockFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn indexer_name(&self) -> String {
        match &self.current {
            Some((config, _)) => config.full_name(),
            None => self.key.clone(),
        }
    }

    /// Rebuilds the indexer when the stored config no longer matches the
    /// running one.
    fn refresh(&mut self, config: IndexerConfig) {
        let changed = match &self.current {
            Some((current, _)) => *current != config,
            None => true,
        };
        if changed {
            if self.current.is_some() {
                log::info!("{} Reloading {} from updated storage", *COMPONENT_NAME, config);
            }
            let executor = self.factory.create(config.clone());
            self.current = Some((config, executor));
        }
    }

    async fn block(&self, message: &StreamMessage) -> anyhow::Result<Block> {
        if let Some(streamer_message) = &message.streamer_message {
            return Ok(Block::new(message.block_height, streamer_message.clone()));
        }
        match &self.fetcher {
            Some(fetcher) => fetcher
                .fetch(message.block_height)
                .await
                .with_context(|| format!("Failed to fetch block {}", message.block_height)),
            None => Err(anyhow::anyhow!(
                "Stream entry {} has no streamer message and no block server is configured",
                message.id
            )),
        }
    }

    async fn report_unprocessed(&self, name: &str) {
        match self.client.unprocessed_count(&self.key).await {
            Ok(count) => metrics::set_unprocessed_messages(name, count),
            Err(err) => log::warn!(
                "{} Failed to read the stream length of {}: {}",
                *COMPONENT_NAME,
                name,
                err
            ),
        }
    }

    /// Processes at most one message.
    pub async fn step(&mut self) -> anyhow::Result<StepOutcome> {
        let record = self
            .client
            .storage_record(&self.key)
            .await?
            .with_context(|| format!("No storage record for stream {}", self.key))?;
        self.refresh(record.to_config(&self.key));
        let name = self.indexer_name();

        let message = match self.client.next_message(&self.key).await? {
            Some(message) => message,
            None => {
                metrics::set_unprocessed_messages(&name, 0);
                return Ok(StepOutcome::Idle);
            }
        };
        let block = self.block(&message).await?;
        let block_height = message.block_height;

        let started = Instant::now();
        let result = match self.current.as_mut() {
            Some((_, executor)) => executor.execute(&block).await,
            None => Err(anyhow::anyhow!("No indexer loaded for {}", self.key)),
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match result {
            Ok(()) => {
                metrics::record_execution(&name, duration_ms, Some(block_height));
                self.client.acknowledge(&self.key, &message.id).await?;
                self.failures = 0;
                StepOutcome::Processed(block_height)
            }
            Err(err) => {
                metrics::record_execution(&name, duration_ms, None);
                log::error!("{} {} failed on block {}: {:#}", *COMPONENT_NAME, name, block_height, err);
                self.failures += 1;
                match self.options.on_failure {
                    OnFailure::Skip => {
                        self.client.acknowledge(&self.key, &message.id).await?;
                        StepOutcome::Skipped(block_height)
                    }
                    OnFailure::Retry => StepOutcome::Failed(block_height),
                }
            }
        };
        self.report_unprocessed(&name).await;
        Ok(outcome)
    }

    fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.options.backoff.delay_for(exponent)
    }

    /// Runs until the task is aborted.
    pub async fn run(mut self) {
        log::info!("{} Starting worker for {}", *COMPONENT_NAME, self.key);
        loop {
            match self.step().await {
                Ok(StepOutcome::Idle) => tokio::time::sleep(self.options.poll_interval).await,
                Ok(StepOutcome::Processed(_)) | Ok(StepOutcome::Skipped(_)) => {}
                Ok(StepOutcome::Failed(_)) => tokio::time::sleep(self.backoff()).await,
                Err(err) => {
                    log::error!(
                        "{} Worker for {} hit an error: {:#}",
                        *COMPONENT_NAME,
                        self.indexer_name(),
                        err
                    );
                    self.failures += 1;
                    tokio::time::sleep(self.backoff()).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::redis_client::StorageRecord;
    use serde_json::json;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStream {
        pub keys: Mutex<Vec<String>>,
        pub storage: Mutex<Option<StorageRecord>>,
        pub messages: Mutex<VecDeque<StreamMessage>>,
        pub acknowledged: Mutex<Vec<String>>,
        pub failing_acks: Mutex<u32>,
    }

    impl MemoryStream {
        pub fn with_code(code: &str) -> Self {
            let stream = MemoryStream::default();
            stream.set_code(code);
            stream
        }

        pub fn set_code(&self, code: &str) {
            *self.storage.lock().unwrap() = Some(StorageRecord {
                account_id: "morgs.near".to_string(),
                function_name: "feed".to_string(),
                code: code.to_string(),
                schema: "CREATE TABLE posts (id INT);".to_string(),
                log_level: None,
                version: None,
            });
        }

        pub fn push(&self, block_height: u64, with_message: bool) {
            let streamer_message = if with_message {
                Some(json!({ "block": { "header": { "height": block_height } } }))
            } else {
                None
            };
            self.messages.lock().unwrap().push_back(StreamMessage {
                id: format!("{}-0", block_height),
                block_height,
                streamer_message,
            });
        }
    }

    #[async_trait]
    impl StreamClient for MemoryStream {
        async fn stream_keys(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn storage_record(&self, _: &str) -> anyhow::Result<Option<StorageRecord>> {
            Ok(self.storage.lock().unwrap().clone())
        }

        async fn next_message(&self, _: &str) -> anyhow::Result<Option<StreamMessage>> {
            Ok(self.messages.lock().unwrap().front().cloned())
        }

        async fn acknowledge(&self, _: &str, id: &str) -> anyhow::Result<()> {
            let mut failing_acks = self.failing_acks.lock().unwrap();
            if *failing_acks > 0 {
                *failing_acks -= 1;
                anyhow::bail!("connection reset before XDEL of {}", id);
            }
            self.messages.lock().unwrap().retain(|message| message.id != id);
            self.acknowledged.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn unprocessed_count(&self, _: &str) -> anyhow::Result<u64> {
            Ok(self.messages.lock().unwrap().len() as u64)
        }
    }

    #[derive(Default)]
    pub struct RecordingFactory {
        pub created: Mutex<u32>,
        pub executions: Arc<Mutex<Vec<(String, u64)>>>,
        pub failing: Arc<Mutex<HashSet<u64>>>,
    }

    struct RecordingExecutor {
        code: String,
        executions: Arc<Mutex<Vec<(String, u64)>>>,
        failing: Arc<Mutex<HashSet<u64>>>,
    }

    #[async_trait]
    impl BlockExecutor for RecordingExecutor {
        async fn execute(&mut self, block: &Block) -> anyhow::Result<()> {
            let height = block.block_height();
            self.executions.lock().unwrap().push((self.code.clone(), height));
            if self.failing.lock().unwrap().contains(&height) {
                anyhow::bail!("boom at {}", height);
            }
            Ok(())
        }
    }

    impl IndexerFactory for RecordingFactory {
        fn create(&self, config: IndexerConfig) -> Box<dyn BlockExecutor> {
            *self.created.lock().unwrap() += 1;
            Box::new(RecordingExecutor {
                code: config.code,
                executions: self.executions.clone(),
                failing: self.failing.clone(),
            })
        }
    }

    struct StaticFetcher;

    #[async_trait]
    impl BlockFetcher for StaticFetcher {
        async fn fetch(&self, block_height: u64) -> anyhow::Result<Block> {
            Ok(Block::new(block_height, json!({ "fetched": true })))
        }
    }

    fn worker(stream: &Arc<MemoryStream>, factory: &Arc<RecordingFactory>, on_failure: OnFailure) -> StreamWorker {
        StreamWorker::new("morgs.near/feed:block_stream", stream.clone(), factory.clone()).with_options(
            WorkerOptions {
                poll_interval: Duration::from_millis(1),
                on_failure,
                backoff: RetryConfig::new(3, Duration::from_millis(1)),
            },
        )
    }

    fn heights(factory: &RecordingFactory) -> Vec<u64> {
        factory.executions.lock().unwrap().iter().map(|(_, height)| *height).collect()
    }

    #[tokio::test]
    async fn it_works_on_ordered_processing() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(1, true);
        stream.push(2, true);
        let factory = Arc::new(RecordingFactory::default());
        let mut worker = worker(&stream, &factory, OnFailure::Retry);

        assert_eq!(StepOutcome::Processed(1), worker.step().await.unwrap());
        assert_eq!(StepOutcome::Processed(2), worker.step().await.unwrap());
        assert_eq!(StepOutcome::Idle, worker.step().await.unwrap());
        assert_eq!(vec![1, 2], heights(&factory));
        assert_eq!(vec!["1-0", "2-0"], *stream.acknowledged.lock().unwrap());
        assert_eq!(1, *factory.created.lock().unwrap());
    }

    #[tokio::test]
    async fn it_works_on_ordered_processing_in_the_run_loop() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        for height in 1..=3 {
            stream.push(height, true);
        }
        let factory = Arc::new(RecordingFactory::default());
        let task = tokio::spawn(worker(&stream, &factory, OnFailure::Retry).run());

        for height in 4..=5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            stream.push(height, true);
        }
        for _ in 0..200 {
            if stream.acknowledged.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();

        assert_eq!(vec![1, 2, 3, 4, 5], heights(&factory));
        assert!(stream.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_works_on_resuming_after_a_lost_acknowledgement() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(1, true);
        stream.push(2, true);
        *stream.failing_acks.lock().unwrap() = 1;
        let factory = Arc::new(RecordingFactory::default());

        let mut crashed = worker(&stream, &factory, OnFailure::Retry);
        assert!(crashed.step().await.is_err());
        drop(crashed);
        assert!(stream.acknowledged.lock().unwrap().is_empty());

        let mut restarted = worker(&stream, &factory, OnFailure::Retry);
        assert_eq!(StepOutcome::Processed(1), restarted.step().await.unwrap());
        assert_eq!(StepOutcome::Processed(2), restarted.step().await.unwrap());
        assert_eq!(StepOutcome::Idle, restarted.step().await.unwrap());

        assert_eq!(vec![1, 1, 2], heights(&factory));
        assert_eq!(vec!["1-0", "2-0"], *stream.acknowledged.lock().unwrap());
    }

    #[tokio::test]
    async fn it_works_on_retrying_failed_blocks() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(1, true);
        stream.push(2, true);
        let factory = Arc::new(RecordingFactory::default());
        factory.failing.lock().unwrap().insert(2);
        let mut worker = worker(&stream, &factory, OnFailure::Retry);

        assert_eq!(StepOutcome::Processed(1), worker.step().await.unwrap());
        assert_eq!(StepOutcome::Failed(2), worker.step().await.unwrap());
        assert_eq!(StepOutcome::Failed(2), worker.step().await.unwrap());
        assert_eq!(Duration::from_millis(2), worker.backoff());

        factory.failing.lock().unwrap().clear();
        assert_eq!(StepOutcome::Processed(2), worker.step().await.unwrap());
        assert_eq!(vec![1, 2, 2, 2], heights(&factory));
        assert_eq!(vec!["1-0", "2-0"], *stream.acknowledged.lock().unwrap());
    }

    #[tokio::test]
    async fn it_works_on_skipping_failed_blocks() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(2, true);
        stream.push(3, true);
        let factory = Arc::new(RecordingFactory::default());
        factory.failing.lock().unwrap().insert(2);
        let mut worker = worker(&stream, &factory, OnFailure::Skip);

        assert_eq!(StepOutcome::Skipped(2), worker.step().await.unwrap());
        assert_eq!(StepOutcome::Processed(3), worker.step().await.unwrap());
        assert_eq!(vec!["2-0", "3-0"], *stream.acknowledged.lock().unwrap());
    }

    #[tokio::test]
    async fn it_works_on_storage_refresh() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(1, true);
        stream.push(2, true);
        let factory = Arc::new(RecordingFactory::default());
        let mut worker = worker(&stream, &factory, OnFailure::Retry);

        worker.step().await.unwrap();
        stream.set_code("b");
        worker.step().await.unwrap();
        assert_eq!(2, *factory.created.lock().unwrap());
        assert_eq!(
            vec![("a".to_string(), 1), ("b".to_string(), 2)],
            *factory.executions.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn it_works_on_entries_without_streamer_message() {
        let stream = Arc::new(MemoryStream::with_code("a"));
        stream.push(7, false);
        let factory = Arc::new(RecordingFactory::default());

        let mut without_fetcher = worker(&stream, &factory, OnFailure::Retry);
        assert!(without_fetcher.step().await.is_err());
        assert!(stream.acknowledged.lock().unwrap().is_empty());

        let mut with_fetcher = worker(&stream, &factory, OnFailure::Retry).with_fetcher(Arc::new(StaticFetcher));
        assert_eq!(StepOutcome::Processed(7), with_fetcher.step().await.unwrap());
    }

    #[tokio::test]
    async fn it_works_on_missing_storage() {
        let stream = Arc::new(MemoryStream::default());
        stream.push(1, true);
        let factory = Arc::new(RecordingFactory::default());
        let mut worker = worker(&stream, &factory, OnFailure::Retry);
        assert!(worker.step().await.is_err());
        assert_eq!(0, *factory.created.lock().unwrap());
    }

    #[test]
    fn it_works_on_failure_policy_names() {
        use std::str::FromStr;
        assert_eq!(OnFailure::Skip, OnFailure::from_str("skip").unwrap());
        assert_eq!("retry", OnFailure::Retry.to_string());
        assert!(OnFailure::from_str("drop").is_err());
    }
}
