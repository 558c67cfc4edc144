use super::prelude::lazy_static::lazy_static;
use std::env;

pub const METADATA_TABLE_NAME: &str = "sys_metadata";
pub const LOGS_TABLE_NAME: &str = "sys_logs";
pub const SYSTEM_TABLES: [&str; 2] = [METADATA_TABLE_NAME, LOGS_TABLE_NAME];

pub const STATUS_ATTRIBUTE: &str = "STATUS";
pub const LAST_PROCESSED_BLOCK_HEIGHT_ATTRIBUTE: &str = "LAST_PROCESSED_BLOCK_HEIGHT";

lazy_static! {
    pub static ref COMPONENT_NAME: String = String::from("[IndexerRunner]");
    pub static ref SOCIAL_API_URL: String =
        env::var("SOCIAL_API_URL").unwrap_or(String::from("https://api.near.social"));
}

pub fn is_system_table(table_name: &str) -> bool {
    SYSTEM_TABLES.contains(&table_name)
}
