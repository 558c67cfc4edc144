use crate::block::Block;
use crate::context::{ContextBuilder, LogBuffer};
use crate::sandbox::Sandbox;
use anyhow::Context as _;
use async_trait::async_trait;
use indexer_common::consts::COMPONENT_NAME;
use indexer_common::{IndexerConfig, IndexerStatus, LogEntry};
use indexer_provisioner::Provisioner;
use indexer_storage_postgres::{IndexerMetaFactory, IndexerMetaStore};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The part of provisioning an execution depends on.
#[async_trait]
pub trait ProvisionerApi: Send + Sync {
    async fn is_provisioned(&self, config: &IndexerConfig) -> anyhow::Result<bool>;
    async fn provision_user_api(&self, config: &IndexerConfig) -> anyhow::Result<()>;
}

#[async_trait]
impl ProvisionerApi for Provisioner {
    async fn is_provisioned(&self, config: &IndexerConfig) -> anyhow::Result<bool> {
        Provisioner::is_provisioned(self, config).await
    }

    async fn provision_user_api(&self, config: &IndexerConfig) -> anyhow::Result<()> {
        Provisioner::provision_user_api(self, config).await
    }
}

#[derive(Clone, Debug)]
pub struct IndexerOptions {
    /// Provision resources before the first execution.
    pub provision: bool,
    pub sandbox: Sandbox,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        IndexerOptions {
            provision: true,
            sandbox: Sandbox::default(),
        }
    }
}

/// Runs one indexer function block after block.
///
/// Status moves `PROVISIONING -> RUNNING -> FAILING` and back to `RUNNING`
/// on the next success. The last written status is cached so an unchanged
/// status is not written again.
pub struct Indexer {
    config: IndexerConfig,
    provisioner: Arc<dyn ProvisionerApi>,
    meta_factory: Arc<dyn IndexerMetaFactory>,
    context_builder: ContextBuilder,
    options: IndexerOptions,
    status: Option<IndexerStatus>,
    provisioned: bool,
    executions: u64,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        provisioner: Arc<dyn ProvisionerApi>,
        meta_factory: Arc<dyn IndexerMetaFactory>,
        context_builder: ContextBuilder,
    ) -> Self {
        Indexer {
            config,
            provisioner,
            meta_factory,
            context_builder,
            options: IndexerOptions::default(),
            status: None,
            provisioned: false,
            executions: 0,
        }
    }

    pub fn with_options(mut self, options: IndexerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn status(&self) -> Option<IndexerStatus> {
        self.status
    }

    async fn ensure_provisioned(&mut self) -> anyhow::Result<()> {
        if !self.options.provision || self.provisioned {
            return Ok(());
        }
        let provisioned = self
            .provisioner
            .is_provisioned(&self.config)
            .await
            .context("Failed to check provisioning state")?;
        if !provisioned {
            self.provisioner
                .provision_user_api(&self.config)
                .await
                .context("Failed to provision indexer resources")?;
        }
        self.provisioned = true;
        Ok(())
    }

    async fn set_status(&mut self, meta: &dyn IndexerMetaStore, status: IndexerStatus) {
        if self.status == Some(status) {
            return;
        }
        match meta.set_status(status).await {
            Ok(()) => self.status = Some(status),
            Err(err) => log::error!(
                "{} Failed to set status of {} to {}: {}",
                *COMPONENT_NAME,
                self.config,
                status,
                err
            ),
        }
    }

    async fn run_function(&self, block: &Block, logs: LogBuffer) -> anyhow::Result<()> {
        let context = self.context_builder.build(&self.config, logs).await?;
        self.options
            .sandbox
            .run(&self.config.code, block.clone(), context)
            .await?;
        Ok(())
    }

    async fn flush_logs(&self, meta: &dyn IndexerMetaStore, entries: Vec<LogEntry>) {
        if let Err(err) = meta.write_logs(entries).await {
            if self.executions == 1 {
                log::error!("{} Failed to write logs of {}: {}", *COMPONENT_NAME, self.config, err);
            } else {
                log::debug!("{} Failed to write logs of {}: {}", *COMPONENT_NAME, self.config, err);
            }
        }
    }

    /// Runs the function against `block`. Logs are flushed whatever the
    /// outcome; progress is recorded only on success.
    pub async fn execute(&mut self, block: &Block) -> anyhow::Result<()> {
        self.executions += 1;
        let block_height = block.block_height();
        if let Some(timestamp) = block.timestamp_nanosec() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            log::debug!(
                "{} {} is {}ms behind at block {}",
                *COMPONENT_NAME,
                self.config,
                now.saturating_sub(timestamp) / 1_000_000,
                block_height
            );
        }

        self.ensure_provisioned().await?;
        let meta = self
            .meta_factory
            .create(&self.config)
            .await
            .context("Failed to connect to indexer metadata")?;

        let logs = LogBuffer::new(self.config.log_level, Some(block_height));
        logs.push(LogEntry::system_info(
            format!("Running function {} on block {}", self.config.full_name(), block_height),
            Some(block_height),
        ));
        self.set_status(meta.as_ref(), IndexerStatus::Running).await;

        let result = self.run_function(block, logs.clone()).await;
        match &result {
            Ok(()) => {
                if let Err(err) = meta.update_block_height(block_height).await {
                    log::error!(
                        "{} Failed to record block {} for {}: {}",
                        *COMPONENT_NAME,
                        block_height,
                        self.config,
                        err
                    );
                }
            }
            Err(err) => logs.push(LogEntry::system_error(
                format!("Error running IndexerFunction: {}", err),
                Some(block_height),
            )),
        }

        self.flush_logs(meta.as_ref(), logs.take()).await;

        if result.is_err() {
            self.set_status(meta.as_ref(), IndexerStatus::Failing).await;
        }
        result.with_context(|| format!("Failed to execute {} on block {}", self.config, block_height))
    }
}
