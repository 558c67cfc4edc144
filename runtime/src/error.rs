use std::time::Duration;
use thiserror::Error;

/// Failures of indexer code. Messages carry what the script did wrong and
/// never the engine's internals, so they are safe to show the tenant.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to compile indexer code: {0}")]
    Compile(String),
    #[error("{0}")]
    Execution(String),
    #[error("Indexer code hit the timeout of {0:?}")]
    Timeout(Duration),
    #[error("Indexer code was aborted: {0}")]
    Task(String),
}

impl SandboxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }
}
