use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use warp::Filter;

const INDEXER_LABEL: &str = "indexer";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref UNPROCESSED_STREAM_MESSAGES: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "indexer_unprocessed_stream_messages",
            "Number of messages left in the block stream of an indexer."
        ),
        &[INDEXER_LABEL]
    )
    .unwrap();
    pub static ref EXECUTION_DURATION_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "indexer_execution_duration_ms",
            "Time taken to run an indexer function on one block, in milliseconds."
        )
        .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]),
        &[INDEXER_LABEL]
    )
    .unwrap();
    pub static ref EXECUTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_executions_total", "Number of blocks an indexer function was run on."),
        &[INDEXER_LABEL]
    )
    .unwrap();
    pub static ref EXECUTION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "indexer_execution_failures_total",
            "Number of failed runs of an indexer function."
        ),
        &[INDEXER_LABEL]
    )
    .unwrap();
    pub static ref LAST_PROCESSED_BLOCK_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "indexer_last_processed_block_height",
            "Height of the last block an indexer function completed."
        ),
        &[INDEXER_LABEL]
    )
    .unwrap();
}

pub fn register_custom_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(UNPROCESSED_STREAM_MESSAGES.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_DURATION_MS.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_FAILURES.clone()))?;
    REGISTRY.register(Box::new(LAST_PROCESSED_BLOCK_HEIGHT.clone()))?;
    Ok(())
}

pub fn record_execution(indexer: &str, duration_ms: f64, block_height: Option<u64>) {
    EXECUTIONS.with_label_values(&[indexer]).inc();
    EXECUTION_DURATION_MS
        .with_label_values(&[indexer])
        .observe(duration_ms);
    match block_height {
        Some(height) => LAST_PROCESSED_BLOCK_HEIGHT
            .with_label_values(&[indexer])
            .set(height as i64),
        None => EXECUTION_FAILURES.with_label_values(&[indexer]).inc(),
    }
}

pub fn set_unprocessed_messages(indexer: &str, count: u64) {
    UNPROCESSED_STREAM_MESSAGES
        .with_label_values(&[indexer])
        .set(count as i64);
}

/// Drops the series of a stopped indexer.
pub fn remove_indexer(indexer: &str) {
    let _ = UNPROCESSED_STREAM_MESSAGES.remove_label_values(&[indexer]);
    let _ = EXECUTION_DURATION_MS.remove_label_values(&[indexer]);
    let _ = EXECUTIONS.remove_label_values(&[indexer]);
    let _ = EXECUTION_FAILURES.remove_label_values(&[indexer]);
    let _ = LAST_PROCESSED_BLOCK_HEIGHT.remove_label_values(&[indexer]);
}

pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        log::error!("Could not encode metrics: {}", err);
    }
    String::from_utf8(buffer).unwrap_or_else(|err| {
        log::error!("Metrics are not valid utf8: {}", err);
        String::default()
    })
}

pub async fn serve_metrics(port: u16) {
    let route = warp::path!("metrics")
        .and(warp::get())
        .map(|| encode_metrics());
    let socket_addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Serving metrics on {}/metrics", socket_addr);
    warp::serve(route).run(socket_addr).await;
}
