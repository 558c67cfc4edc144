use diesel::r2d2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not connect to postgres: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("could not get a pooled connection: {0}")]
    Pool(#[from] r2d2::PoolError),
    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Table {0} does not exist in schema")]
    UnknownTable(String),
    #[error("Column {column} does not exist in table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("{0} requires a non empty filter")]
    EmptyFilter(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("blocking task failed: {0}")]
    Task(String),
}
