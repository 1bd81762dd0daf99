//! Driver boundary.
//!
//! The pool manager and executor never talk to a database library directly. They
//! consume the three traits in this module, which mirror what a database driver
//! exposes: pool construction, connection checkout, statement execution and
//! transaction control. [`SqlxDriver`](super::sqlx_driver::SqlxDriver) is the
//! production implementation; tests plug in scripted drivers.
//!
//! Pool-level errors travel on a separate channel ([`PoolEventSender`]) handed to
//! the driver when a pool is created. That channel is how the pool manager learns
//! that the server connection was lost and the pool must be rebuilt.

use crate::config::PoolConfig;
use crate::models::{ExecResult, QueryParam, Row};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Error code carried by the connection-lost signal.
pub const CONNECTION_LOST_CODE: &str = "PROTOCOL_CONNECTION_LOST";

/// Classification of a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The network link to the server failed at the protocol level.
    ConnectionLost,
    /// The server rejected the statement (syntax, constraint, permission...).
    Database,
    /// The pool itself failed (closed, misconfigured).
    Pool,
    Timeout,
    Other,
}

/// An error reported by the driver.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// The distinguished connection-lost signal.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(
            DriverErrorKind::ConnectionLost,
            Some(CONNECTION_LOST_CODE.to_string()),
            message,
        )
    }

    pub fn database(code: Option<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Database, code, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, None, message)
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == DriverErrorKind::ConnectionLost
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A pool-level error, stamped with the generation of the pool that raised it.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub generation: u64,
    pub error: DriverError,
}

/// Error observer handle given to a pool at construction time.
#[derive(Debug, Clone)]
pub struct PoolEventSender {
    generation: u64,
    tx: UnboundedSender<PoolEvent>,
}

impl PoolEventSender {
    pub fn new(generation: u64, tx: UnboundedSender<PoolEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the pool this sender belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a pool-level error to the pool manager.
    pub fn report(&self, error: DriverError) {
        let event = PoolEvent {
            generation: self.generation,
            error,
        };
        if self.tx.send(event).is_err() {
            debug!(
                generation = self.generation,
                "Pool event dropped: observer no longer running"
            );
        }
    }
}

/// Failed connection checkout.
///
/// Some drivers hand back a connection together with the error; it must be
/// released before the error is propagated.
pub struct AcquireFailure {
    pub error: DriverError,
    pub connection: Option<Box<dyn DriverConnection>>,
}

impl AcquireFailure {
    pub fn new(error: DriverError) -> Self {
        Self {
            error,
            connection: None,
        }
    }

    pub fn with_connection(error: DriverError, connection: Box<dyn DriverConnection>) -> Self {
        Self {
            error,
            connection: Some(connection),
        }
    }
}

impl std::fmt::Debug for AcquireFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireFailure")
            .field("error", &self.error)
            .field("has_connection", &self.connection.is_some())
            .finish()
    }
}

/// Creates pools from configuration.
pub trait Driver: Send + Sync {
    /// Short driver name for logging.
    fn name(&self) -> &'static str;

    /// Build a pool. Must not block on the network: rebuilds call this while the
    /// old pool is being discarded.
    fn create_pool(
        &self,
        config: &PoolConfig,
        events: PoolEventSender,
    ) -> DriverResult<Arc<dyn DriverPool>>;
}

/// A live pool handle.
#[async_trait]
pub trait DriverPool: Send + Sync + std::fmt::Debug {
    /// Check out a connection.
    ///
    /// `Ok(None)` means the driver produced neither a connection nor an error.
    async fn get_connection(&self) -> Result<Option<Box<dyn DriverConnection>>, AcquireFailure>;
}

/// One leased physical connection.
#[async_trait]
pub trait DriverConnection: Send + std::fmt::Debug {
    /// Run a statement that produces rows.
    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DriverResult<Vec<Row>>;

    /// Run a statement that produces result metadata. `None` if the driver
    /// returned no result data.
    async fn execute(&mut self, sql: &str, params: &[QueryParam])
    -> DriverResult<Option<ExecResult>>;

    async fn begin_transaction(&mut self) -> DriverResult<()>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;

    /// Return the connection to the pool it came from.
    async fn release(self: Box<Self>);

    /// Close the connection instead of returning it. Used when a transaction on it
    /// could not be rolled back.
    async fn discard(self: Box<Self>);
}
