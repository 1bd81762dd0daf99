//! Data models shared by the pool manager, executor and drivers.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, TransactionState};
pub use query::{ExecResult, InsertOutcome, QueryParam, Row, UpdateOutcome};
