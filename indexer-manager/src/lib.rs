pub mod block_fetcher;
pub mod metrics;
pub mod opt;
pub mod redis_client;
pub mod stream_manager;
pub mod worker;

use lazy_static::lazy_static;
use std::env;
use std::time::Duration;

lazy_static! {
    /// How often the `streams` set is re-read.
    pub static ref STREAM_SYNC_INTERVAL: Duration = env::var("STREAM_SYNC_INTERVAL_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5));
}
