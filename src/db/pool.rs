//! Connection pool management.
//!
//! [`PoolManager`] owns exactly one live pool at a time and replaces it wholesale
//! when the driver reports that the server connection was lost.
//!
//! # Rebuild model
//!
//! - Every pool is tagged with a generation number. Pool-level errors arrive on an
//!   unbounded channel, stamped with the generation of the pool that raised them.
//! - A background observer task drains the channel and calls
//!   [`PoolManager::handle_pool_event`]. It holds only a `Weak` reference, so it
//!   never keeps the manager alive.
//! - A connection-lost event for the current generation builds a fresh pool from
//!   the same configuration and swaps it in. Events from older generations are
//!   ignored: that pool has already been replaced.
//! - Leases taken from a replaced pool finish normally and go back to the old pool,
//!   which is dropped when its last lease is released.
//! - The slot lock is a `std::sync::RwLock` and is never held across an await.

use crate::config::PoolConfig;
use crate::db::connection::Connection;
use crate::db::driver::{Driver, DriverPool, PoolEvent, PoolEventSender};
use crate::db::sqlx_driver::SqlxDriver;
use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The active pool and its generation.
struct PoolSlot {
    pool: Arc<dyn DriverPool>,
    generation: u64,
}

pub struct PoolManager {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    slot: RwLock<PoolSlot>,
    events_tx: UnboundedSender<PoolEvent>,
    rebuilds: AtomicU64,
    /// Observer task handle. Uses std::sync::Mutex for synchronous storage.
    observer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Validate `config`, create the first pool and register the error observer.
    ///
    /// `config` must be a JSON object; anything else fails with
    /// [`DbError::Configuration`] and no pool is created. Must be called from
    /// within a Tokio runtime.
    pub fn initialize(config: JsonValue, driver: Arc<dyn Driver>) -> DbResult<Arc<Self>> {
        let config = PoolConfig::from_value(config)?;
        Self::with_config(config, driver)
    }

    /// Same as [`initialize`](Self::initialize) with an already-parsed configuration.
    pub fn with_config(config: PoolConfig, driver: Arc<dyn Driver>) -> DbResult<Arc<Self>> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = driver
            .create_pool(&config, PoolEventSender::new(1, events_tx.clone()))
            .map_err(|e| DbError::configuration(format!("Failed to create pool: {e}")))?;

        info!(
            driver = driver.name(),
            url = ?config.masked_url(),
            host = ?config.host,
            database = ?config.database,
            generation = 1,
            "Connection pool created"
        );

        let manager = Arc::new(Self {
            config,
            driver,
            slot: RwLock::new(PoolSlot {
                pool,
                generation: 1,
            }),
            events_tx,
            rebuilds: AtomicU64::new(0),
            observer_handle: std::sync::Mutex::new(None),
        });

        // Weak reference avoids a cycle between the manager and its observer
        let handle = Self::spawn_observer(Arc::downgrade(&manager), events_rx);
        if let Ok(mut guard) = manager.observer_handle.lock() {
            *guard = Some(handle);
        }

        Ok(manager)
    }

    /// Initialize with the sqlx driver.
    pub fn connect(config: JsonValue) -> DbResult<Arc<Self>> {
        Self::initialize(config, Arc::new(SqlxDriver))
    }

    fn spawn_observer(
        manager: Weak<Self>,
        mut events_rx: UnboundedReceiver<PoolEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_pool_event(event);
            }
            debug!("Pool error observer stopped");
        })
    }

    /// Pool error observer.
    ///
    /// Rebuilds the pool on a connection-lost signal from the current pool and
    /// returns `true` when a new pool was swapped in. Other errors are logged only.
    /// Safe to call any number of times.
    pub fn handle_pool_event(&self, event: PoolEvent) -> bool {
        if !event.error.is_connection_lost() {
            warn!(
                generation = event.generation,
                error = %event.error,
                code = ?event.error.code,
                "Pool error"
            );
            return false;
        }

        let mut slot = match self.slot.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };

        if event.generation < slot.generation {
            debug!(
                event_generation = event.generation,
                current_generation = slot.generation,
                "Ignoring connection loss from a replaced pool"
            );
            return false;
        }

        let next = slot.generation + 1;
        warn!(
            generation = slot.generation,
            error = %event.error,
            "Database connection lost, rebuilding pool"
        );

        let events = PoolEventSender::new(next, self.events_tx.clone());
        match self.driver.create_pool(&self.config, events) {
            Ok(pool) => {
                // The old handle is dropped here; in-flight leases keep it alive
                *slot = PoolSlot {
                    pool,
                    generation: next,
                };
                self.rebuilds.fetch_add(1, Ordering::AcqRel);
                info!(generation = next, "Connection pool rebuilt");
                true
            }
            Err(e) => {
                error!(
                    generation = slot.generation,
                    error = %e,
                    "Failed to rebuild connection pool, keeping the current one"
                );
                false
            }
        }
    }

    /// Lease a connection from the current pool.
    pub async fn acquire(&self) -> DbResult<Connection> {
        let (pool, generation) = self.current_pool();

        match pool.get_connection().await {
            Ok(Some(inner)) => {
                let conn = Connection::new(inner, generation);
                debug!(
                    connection_id = %conn.id(),
                    generation = generation,
                    "Connection acquired"
                );
                Ok(conn)
            }
            Ok(None) => {
                warn!(
                    generation = generation,
                    "Pool returned neither a connection nor an error"
                );
                Err(DbError::ConnectionUnavailable)
            }
            Err(failure) => {
                if let Some(partial) = failure.connection {
                    partial.release().await;
                }
                warn!(
                    generation = generation,
                    error = %failure.error,
                    "Failed to acquire connection"
                );
                Err(DbError::connection(failure.error))
            }
        }
    }

    /// Return a connection to the pool it was leased from.
    pub async fn release(&self, conn: Connection) {
        conn.release().await;
    }

    /// Generation of the current pool (1 for the initial pool).
    pub fn generation(&self) -> u64 {
        self.current_pool().1
    }

    /// Number of times the pool has been rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn current_pool(&self) -> (Arc<dyn DriverPool>, u64) {
        let slot = match self.slot.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        (Arc::clone(&slot.pool), slot.generation)
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("driver", &self.driver.name())
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("rebuilds", &self.rebuild_count())
            .finish_non_exhaustive()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.observer_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
