use crate::helper::{default_logging, env_logging, gcp_logging};
use lazy_static::lazy_static;
use std::env;

/**
*** Sets up the process logger to either:
*** - output human readable lines to console (default, INFO level)
*** - follow RUST_LOG filters when the variable is set
*** - emit one JSON object per line for GCP log ingestion
**/
lazy_static! {
    static ref LOG_OPTION: String = env::var("RUST_LOG").unwrap_or(String::from("default")); // If not defined, assume it's INFO
}

#[derive(Clone, Debug, Default)]
pub struct LoggerOptions {
    pub gcp_logging_enabled: bool,
}

pub fn init_logger(component: &str, options: &LoggerOptions) {
    if options.gcp_logging_enabled {
        gcp_logging(component, LOG_OPTION.as_str());
    } else if &*LOG_OPTION == "default" {
        default_logging(component);
    } else {
        env_logging(component, LOG_OPTION.as_str());
    }
}
