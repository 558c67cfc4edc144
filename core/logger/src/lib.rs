pub mod core;
pub mod helper;

pub use crate::core::{init_logger, LoggerOptions};
