pub mod consts;
pub mod indexer;
pub mod util;

pub use indexer::{IndexerConfig, IndexerStatus, LogEntry, LogLevel, LogType};

pub mod prelude {
    pub use anyhow;
    pub use async_trait;
    pub use chrono;
    pub use lazy_static;
    pub use log;
    pub use serde;
    pub use serde_derive;
    pub use serde_json;
    pub use thiserror;
    pub use tokio;

    pub use crate::indexer::{IndexerConfig, IndexerStatus, LogEntry, LogLevel, LogType};
    pub use crate::util::retry::{retry_with_backoff, RetryConfig};
}
