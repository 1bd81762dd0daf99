//! Database layer.
//!
//! - Driver boundary traits and the sqlx implementation
//! - Connection pool management with rebuild on connection loss
//! - Transaction-aware statement execution
//! - Parameter binding and row conversion

pub mod connection;
pub mod driver;
pub mod executor;
pub mod params;
pub mod pool;
pub mod sqlx_driver;
pub mod types;

pub use connection::Connection;
pub use driver::{
    AcquireFailure, CONNECTION_LOST_CODE, Driver, DriverConnection, DriverError,
    DriverErrorKind, DriverPool, DriverResult, PoolEvent, PoolEventSender,
};
pub use executor::QueryExecutor;
pub use pool::PoolManager;
pub use sqlx_driver::SqlxDriver;
