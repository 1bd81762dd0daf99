//! Pooled, transaction-aware SQL execution.
//!
//! [`PoolManager`] owns the connection pool and rebuilds it when the server
//! connection is lost. [`QueryExecutor`] runs `select`/`insert`/`update`
//! statements either on a short-lived lease or inside a caller-held transaction.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use config::{LogConfig, PoolConfig, PoolOptions};
pub use db::{Connection, PoolManager, QueryExecutor, SqlxDriver};
pub use error::{DbError, DbResult};
pub use models::{InsertOutcome, QueryParam, Row, TransactionState, UpdateOutcome};
