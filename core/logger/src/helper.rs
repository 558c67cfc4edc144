/**
 *** Helpers to set up the logger based on the RUST_LOG and GCP_LOGGING_ENABLED options
 **/
use chrono::{Local, Utc};
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::io::Write;

/**
 *** If RUST_LOG is empty the env logger would print nothing, so this installs an INFO logger
 **/
pub fn default_logging(component: &str) {
    let mut builder = human_readable(component);
    builder.filter(None, LevelFilter::Info);
    if builder.try_init().is_ok() {
        log::info!("{}", message("console", "INFO"));
    }
}

pub fn env_logging(component: &str, filters: &str) {
    let mut builder = human_readable(component);
    builder.parse_filters(filters);
    if builder.try_init().is_ok() {
        log::info!("{}", message("console", filters));
    }
}

/// One JSON object per line, using the field names GCP structured logging
/// understands.
pub fn gcp_logging(component: &str, filters: &str) {
    let component = component.to_string();
    let mut builder = Builder::new();
    builder.format(move |buf, record| {
        let line = serde_json::json!({
            "severity": gcp_severity(record.level()),
            "message": record.args().to_string(),
            "component": &component,
            "target": record.target(),
            "time": Utc::now().to_rfc3339(),
        });
        writeln!(buf, "{}", line)
    });
    if filters == "default" {
        builder.filter(None, LevelFilter::Info);
    } else {
        builder.parse_filters(filters);
    }
    if builder.try_init().is_ok() {
        log::info!("{}", message("gcp", filters));
    }
}

fn human_readable(component: &str) -> Builder {
    let component = component.to_string();
    let mut builder = Builder::new();
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - [{}] {}",
            Local::now().format("%Y-%m-%dT%H:%M:%S"), // Reformat to human-readable timestamp
            record.level(),
            component,
            record.target(),
            record.args(),
        )
    });
    builder
}

pub fn gcp_severity(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

pub fn message(output_type: &str, level: &str) -> String {
    format!(
        "Logger will now output to {} with the level: {}",
        output_type, level
    )
}
