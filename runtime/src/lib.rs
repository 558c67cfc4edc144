pub mod block;
pub mod context;
pub mod error;
pub mod indexer;
pub mod sandbox;
pub mod transform;

#[cfg(test)]
mod test_support;

pub use self::block::{parse_event_log, Block, BlockFetcher};
pub use self::context::{Context, ContextBuilder, DbTable, LogBuffer};
pub use self::error::SandboxError;
pub use self::indexer::{Indexer, IndexerOptions, ProvisionerApi};
pub use self::sandbox::{Sandbox, SandboxLimits, EXECUTION_TIMEOUT};
pub use self::transform::prepare_source;
