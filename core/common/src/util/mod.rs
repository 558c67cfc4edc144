pub mod retry;
pub mod sql;
