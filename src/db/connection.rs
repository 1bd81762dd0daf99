//! Leased connection handle.
//!
//! A [`Connection`] is exclusively owned by whoever holds it. Releasing and
//! committing consume the handle, so a released or committed connection cannot be
//! used again. A handle dropped without being released is still returned to its
//! pool, from a spawned task, with a warning.
//!
//! A transaction still open at release is rolled back first. When that rollback
//! (or an earlier one) fails, the driver connection is closed instead of being
//! returned, so no later lease inherits the transaction.

use crate::db::driver::{DriverConnection, DriverError, DriverResult};
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, QueryParam, Row, TransactionState};
use tracing::{debug, error, warn};

pub struct Connection {
    id: String,
    generation: u64,
    state: TransactionState,
    /// A rollback failed; the session state is unknown.
    broken: bool,
    inner: Option<Box<dyn DriverConnection>>,
}

impl Connection {
    pub(crate) fn new(inner: Box<dyn DriverConnection>, generation: u64) -> Self {
        Self {
            id: generate_connection_id(),
            generation,
            state: TransactionState::Idle,
            broken: false,
            inner: Some(inner),
        }
    }

    /// Unique lease identifier, used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generation of the pool this connection was leased from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// True between a successful begin and commit/rollback.
    pub fn in_transaction(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Reject statements on a connection whose transaction was rolled back.
    pub(crate) fn ensure_usable(&self) -> DbResult<()> {
        if self.state.is_terminal() {
            return Err(DbError::invalid_input(format!(
                "Connection '{}' is {}; release it and start a new transaction",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn driver(&mut self) -> DriverResult<&mut Box<dyn DriverConnection>> {
        self.inner
            .as_mut()
            .ok_or_else(|| DriverError::other("connection already released"))
    }

    pub(crate) async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DriverResult<Vec<Row>> {
        self.driver()?.fetch(sql, params).await
    }

    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DriverResult<Option<ExecResult>> {
        self.driver()?.execute(sql, params).await
    }

    pub(crate) async fn begin(&mut self) -> DriverResult<()> {
        self.driver()?.begin_transaction().await?;
        self.state = TransactionState::Active;
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> DriverResult<()> {
        self.driver()?.commit().await?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Roll back. The transaction is considered finished even if the command fails.
    pub(crate) async fn rollback(&mut self) -> DriverResult<()> {
        let result = self.driver()?.rollback().await;
        if result.is_err() {
            self.broken = true;
        }
        if self.state == TransactionState::Active {
            self.state = TransactionState::RolledBack;
        }
        result
    }

    /// Return the connection to its pool, rolling back an open transaction first.
    pub async fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            hand_back(&self.id, self.state, self.broken, inner).await;
            debug!(
                connection_id = %self.id,
                generation = self.generation,
                state = %self.state,
                "Connection released"
            );
        }
    }
}

async fn hand_back(
    id: &str,
    state: TransactionState,
    broken: bool,
    mut inner: Box<dyn DriverConnection>,
) {
    let mut discard = broken;
    if state == TransactionState::Active {
        match inner.rollback().await {
            Ok(()) => warn!(connection_id = %id, "Open transaction rolled back on release"),
            Err(e) => {
                error!(
                    connection_id = %id,
                    error = %e,
                    "Rollback on release failed"
                );
                discard = true;
            }
        }
    }

    if discard {
        warn!(connection_id = %id, "Closing connection instead of returning it to the pool");
        inner.discard().await;
    } else {
        inner.release().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        warn!(
            connection_id = %self.id,
            state = %self.state,
            "Connection dropped without release - returning it to the pool"
        );

        // Outside a runtime the driver handle is simply dropped
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let id = std::mem::take(&mut self.id);
            let (state, broken) = (self.state, self.broken);
            handle.spawn(async move {
                hand_back(&id, state, broken, inner).await;
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("released", &self.inner.is_none())
            .finish()
    }
}

/// Generate a unique connection lease ID.
fn generate_connection_id() -> String {
    format!("conn_{}", uuid::Uuid::new_v4().simple())
}
