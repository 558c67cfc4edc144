use anyhow::Context;
use diesel::PgConnection;
use hasura_client::HasuraClient;
use indexer_common::consts::COMPONENT_NAME;
use indexer_common::prelude::RetryConfig;
use indexer_manager::block_fetcher::HttpBlockFetcher;
use indexer_manager::metrics::{register_custom_metrics, serve_metrics};
use indexer_manager::opt::Opt;
use indexer_manager::redis_client::RedisStreamClient;
use indexer_manager::stream_manager::StreamManager;
use indexer_manager::worker::{RuntimeIndexerFactory, WorkerOptions};
use indexer_manager::STREAM_SYNC_INTERVAL;
use indexer_provisioner::{PgBouncerOverrides, Provisioner};
use indexer_runtime::{BlockFetcher, ContextBuilder, IndexerOptions, Sandbox, SandboxLimits};
use indexer_storage_postgres::{create_r2d2_connection_pool, PgAdmin};
use logger::{init_logger, LoggerOptions};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    init_logger(
        &COMPONENT_NAME,
        &LoggerOptions {
            gcp_logging_enabled: opt.gcp_logging_enabled,
        },
    );

    let admin_pool = create_r2d2_connection_pool::<PgConnection>(
        &opt.admin_database_url(&opt.pg_database),
        opt.pool_size,
    )
    .context("Failed to create the admin connection pool")?;
    let cron_pool = create_r2d2_connection_pool::<PgConnection>(
        &opt.admin_database_url(&opt.cron_database),
        opt.pool_size,
    )
    .context("Failed to create the cron connection pool")?;
    let admin = Arc::new(PgAdmin::new(
        admin_pool,
        cron_pool,
        &opt.pg_host,
        opt.pg_port,
        &opt.cron_database,
    ));
    let hasura = Arc::new(
        HasuraClient::new(
            &opt.hasura_endpoint,
            &opt.hasura_admin_secret,
            &opt.pg_host,
            opt.pg_port,
        )
        .context("Failed to create the metadata client")?,
    );

    let provisioner = Arc::new(
        Provisioner::new(hasura.clone(), admin)
            .with_pg_bouncer(PgBouncerOverrides {
                host: opt.pg_bouncer_host.clone(),
                port: opt.pg_bouncer_port,
            })
            .with_retry(RetryConfig::new(
                opt.provisioning_max_retries,
                Duration::from_millis(opt.provisioning_base_delay_ms),
            )),
    );
    let context_builder =
        ContextBuilder::new(hasura, provisioner.clone()).with_social_api_url(opt.social_api_url.as_str());
    let options = IndexerOptions {
        provision: true,
        sandbox: Sandbox::new(
            Duration::from_millis(opt.execution_timeout_ms),
            SandboxLimits::default(),
        ),
    };
    let factory = Arc::new(RuntimeIndexerFactory::new(
        provisioner.clone(),
        provisioner,
        context_builder,
        options,
    ));

    register_custom_metrics().context("Failed to register metrics")?;
    tokio::spawn(serve_metrics(opt.port));

    let client = Arc::new(RedisStreamClient::connect(&opt.redis_connection_string).await?);
    let fetcher = opt
        .block_server_url
        .as_deref()
        .map(|url| Arc::new(HttpBlockFetcher::new(url)) as Arc<dyn BlockFetcher>);
    let worker_options = WorkerOptions {
        poll_interval: Duration::from_millis(opt.stream_poll_interval_ms),
        on_failure: opt.on_failure,
        ..WorkerOptions::default()
    };
    log::info!(
        "{} Runner started, failure policy {}, execution timeout {}ms",
        *COMPONENT_NAME,
        opt.on_failure,
        opt.execution_timeout_ms
    );
    StreamManager::new(client, factory, worker_options)
        .with_fetcher(fetcher)
        .run(*STREAM_SYNC_INTERVAL)
        .await;
    Ok(())
}
