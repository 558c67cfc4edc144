use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// Identity and payload of one registered indexer function.
///
/// The identity is `account_id/function_name`; every database name used for
/// the indexer is derived from it, so two configs with the same identity
/// always resolve to the same physical resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub account_id: String,
    pub function_name: String,
    pub code: String,
    pub schema: String,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub redis_stream_key: String,
}

impl IndexerConfig {
    pub fn new(
        account_id: impl Into<String>,
        function_name: impl Into<String>,
        code: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        let account_id = account_id.into();
        let function_name = function_name.into();
        let redis_stream_key = format!("{}/{}:block_stream", account_id, function_name);
        IndexerConfig {
            account_id,
            function_name,
            code: code.into(),
            schema: schema.into(),
            log_level: LogLevel::default(),
            version: 0,
            redis_stream_key,
        }
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn with_redis_stream_key(mut self, key: impl Into<String>) -> Self {
        self.redis_stream_key = key.into();
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_id, self.function_name)
    }

    /// Postgres role owning the account database. Shared by every indexer
    /// of the account.
    pub fn user_name(&self) -> String {
        sanitize_identifier(&self.account_id)
    }

    pub fn database_name(&self) -> String {
        self.user_name()
    }

    pub fn schema_name(&self) -> String {
        sanitize_identifier(&format!("{}_{}", self.account_id, self.function_name))
    }

    pub fn hasura_role_name(&self) -> String {
        self.user_name()
    }

    pub fn log_partition_job_names(&self) -> (String, String) {
        let schema = self.schema_name();
        (
            format!("{}_sys_logs_create_partition", schema),
            format!("{}_sys_logs_delete_partition", schema),
        )
    }
}

impl fmt::Display for IndexerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.function_name)
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_`, which covers the
/// `.` and `-` found in account ids.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexerStatus {
    Provisioning,
    Running,
    Failing,
    Stopped,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    System,
    User,
}

/// One line of tenant visible logging, buffered during an execution and
/// written to `sys_logs` in one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub message: String,
    pub block_height: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        log_type: LogType,
        message: impl Into<String>,
        block_height: Option<u64>,
    ) -> Self {
        LogEntry {
            level,
            log_type,
            message: message.into(),
            block_height,
            timestamp: Utc::now(),
        }
    }

    pub fn system_debug(message: impl Into<String>, block_height: Option<u64>) -> Self {
        Self::new(LogLevel::Debug, LogType::System, message, block_height)
    }

    pub fn system_info(message: impl Into<String>, block_height: Option<u64>) -> Self {
        Self::new(LogLevel::Info, LogType::System, message, block_height)
    }

    pub fn system_error(message: impl Into<String>, block_height: Option<u64>) -> Self {
        Self::new(LogLevel::Error, LogType::System, message, block_height)
    }

    pub fn user(level: LogLevel, message: impl Into<String>, block_height: Option<u64>) -> Self {
        Self::new(level, LogType::User, message, block_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn derives_names_from_identity() {
        let config = IndexerConfig::new("morgs.near", "test-fn", "", "");
        assert_eq!("morgs.near/test-fn", config.full_name());
        assert_eq!("morgs_near", config.user_name());
        assert_eq!("morgs_near", config.database_name());
        assert_eq!("morgs_near", config.hasura_role_name());
        assert_eq!("morgs_near_test_fn", config.schema_name());
        assert_eq!("morgs.near/test-fn:block_stream", config.redis_stream_key);
    }

    #[test]
    fn siblings_share_database_but_not_schema() {
        let first = IndexerConfig::new("acct.near", "fn1", "", "");
        let second = IndexerConfig::new("acct.near", "fn2", "", "");
        assert_eq!(first.database_name(), second.database_name());
        assert_ne!(first.schema_name(), second.schema_name());
    }

    #[test]
    fn status_and_level_round_trip_through_strings() {
        assert_eq!("PROVISIONING", IndexerStatus::Provisioning.to_string());
        assert_eq!(IndexerStatus::Failing, IndexerStatus::from_str("FAILING").unwrap());
        assert_eq!(LogLevel::Warn, LogLevel::from_str("warn").unwrap());
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!("system", LogType::System.to_string());
    }
}
