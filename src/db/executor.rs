//! Transaction-aware statement execution.
//!
//! Every statement operation follows one acquisition rule:
//!
//! - With a caller-supplied connection the statement runs on it. The executor
//!   never releases a connection it did not acquire.
//! - Without one, a connection is leased for the single statement and released
//!   before the result or error is handed back.
//! - `trans = true` without a connection is rejected: a self-acquired connection
//!   is always released, so there would be no transaction to continue.
//!
//! When a statement fails with `trans = true` on a supplied connection, the
//! transaction is rolled back exactly once before the error is returned. The
//! connection stays with the caller, who still has to release it.

use crate::db::connection::Connection;
use crate::db::pool::PoolManager;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, InsertOutcome, QueryParam, Row, TransactionState, UpdateOutcome};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a statement is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Select,
    Insert,
    Update,
}

impl StatementKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

enum StatementOutput {
    Rows(Vec<Row>),
    Exec(Option<ExecResult>),
}

pub struct QueryExecutor {
    pool: Arc<PoolManager>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Lease a connection. The caller must release it.
    pub async fn get_connection(&self) -> DbResult<Connection> {
        self.pool.acquire().await
    }

    pub async fn release(&self, conn: Connection) {
        self.pool.release(conn).await;
    }

    /// Run a row-returning statement. Rows are returned as produced by the driver.
    pub async fn select(
        &self,
        sql: &str,
        params: &[QueryParam],
        conn: Option<&mut Connection>,
        trans: bool,
    ) -> DbResult<Vec<Row>> {
        match self
            .run_statement(StatementKind::Select, sql, params, conn, trans)
            .await?
        {
            StatementOutput::Rows(rows) => Ok(rows),
            StatementOutput::Exec(_) => Ok(Vec::new()),
        }
    }

    /// Run an INSERT and report the generated id, plus the affected row count when
    /// `include_affected_rows` is set.
    pub async fn insert(
        &self,
        sql: &str,
        params: &[QueryParam],
        conn: Option<&mut Connection>,
        trans: bool,
        include_affected_rows: bool,
    ) -> DbResult<InsertOutcome> {
        let result = self
            .run_statement(StatementKind::Insert, sql, params, conn, trans)
            .await?;
        Ok(InsertOutcome::from_exec(
            exec_metadata(result),
            include_affected_rows,
        ))
    }

    /// Run an UPDATE (or DELETE). Reports the affected row count only when asked.
    pub async fn update(
        &self,
        sql: &str,
        params: &[QueryParam],
        conn: Option<&mut Connection>,
        trans: bool,
        include_affected_rows: bool,
    ) -> DbResult<UpdateOutcome> {
        let result = self
            .run_statement(StatementKind::Update, sql, params, conn, trans)
            .await?;
        Ok(UpdateOutcome::from_exec(
            exec_metadata(result),
            include_affected_rows,
        ))
    }

    /// Lease a connection and start a transaction on it.
    ///
    /// If the transaction cannot be started the connection goes back to the pool
    /// and only the error is returned.
    pub async fn begin_transaction(&self) -> DbResult<Connection> {
        let mut conn = self.pool.acquire().await?;

        if let Err(e) = conn.begin().await {
            warn!(
                connection_id = %conn.id(),
                error = %e,
                "Failed to begin transaction"
            );
            conn.release().await;
            return Err(DbError::transaction_begin(e));
        }

        info!(connection_id = %conn.id(), "Transaction started");
        Ok(conn)
    }

    /// Commit and release.
    ///
    /// Never fails: a failed commit is rolled back and logged, and the connection
    /// is released exactly once either way. Use [`try_commit`](Self::try_commit)
    /// to observe the failure.
    pub async fn commit_connection(&self, conn: Connection) {
        let connection_id = conn.id().to_string();
        if let Err(e) = self.finish_transaction(conn).await {
            warn!(
                connection_id = %connection_id,
                error = %e,
                "Transaction was not committed"
            );
        }
    }

    /// Like [`commit_connection`](Self::commit_connection), but a failed commit is
    /// returned as [`DbError::Commit`].
    pub async fn try_commit(&self, conn: Connection) -> DbResult<()> {
        self.finish_transaction(conn).await
    }

    /// Roll back the transaction on `conn`, if one is given.
    ///
    /// The connection is not released. Rollback failures are logged only.
    pub async fn rollback(&self, conn: Option<&mut Connection>, cause: Option<&DbError>) {
        let Some(conn) = conn else {
            debug!("Rollback requested without a connection, nothing to do");
            return;
        };

        match conn.rollback().await {
            Ok(()) => info!(
                connection_id = %conn.id(),
                cause = ?cause.map(ToString::to_string),
                "Transaction rolled back"
            ),
            Err(e) => error!(
                connection_id = %conn.id(),
                error = %e,
                cause = ?cause.map(ToString::to_string),
                "Rollback failed"
            ),
        }
    }

    async fn finish_transaction(&self, mut conn: Connection) -> DbResult<()> {
        if conn.state() == TransactionState::RolledBack {
            let err = DbError::invalid_input(format!(
                "Connection '{}' was already rolled back and cannot be committed",
                conn.id()
            ));
            conn.release().await;
            return Err(err);
        }

        let result = conn.commit().await;
        match &result {
            Ok(()) => info!(connection_id = %conn.id(), "Transaction committed"),
            Err(e) => {
                warn!(connection_id = %conn.id(), error = %e, "Commit failed, rolling back");
                self.rollback(Some(&mut conn), None).await;
            }
        }

        conn.release().await;
        result.map_err(DbError::commit)
    }

    async fn run_statement(
        &self,
        kind: StatementKind,
        sql: &str,
        params: &[QueryParam],
        conn: Option<&mut Connection>,
        trans: bool,
    ) -> DbResult<StatementOutput> {
        match conn {
            Some(conn) => {
                conn.ensure_usable()?;
                match dispatch(conn, kind, sql, params).await {
                    Ok(output) => Ok(output),
                    Err(err) => {
                        if trans {
                            self.rollback(Some(conn), Some(&err)).await;
                        }
                        Err(err)
                    }
                }
            }
            None if trans => Err(DbError::invalid_input(format!(
                "{} with trans=true requires a connection from begin_transaction",
                kind.as_str()
            ))),
            None => {
                let mut conn = self.pool.acquire().await?;
                let result = dispatch(&mut conn, kind, sql, params).await;
                conn.release().await;
                result
            }
        }
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("pool", &self.pool)
            .finish()
    }
}

async fn dispatch(
    conn: &mut Connection,
    kind: StatementKind,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<StatementOutput> {
    debug!(
        connection_id = %conn.id(),
        statement = kind.as_str(),
        sql = %sql,
        params = ?params.iter().map(QueryParam::type_name).collect::<Vec<_>>(),
        "Executing statement"
    );

    let result = match kind {
        StatementKind::Select => conn.fetch(sql, params).await.map(StatementOutput::Rows),
        StatementKind::Insert | StatementKind::Update => {
            conn.execute(sql, params).await.map(StatementOutput::Exec)
        }
    };

    result.map_err(|e| {
        debug!(connection_id = %conn.id(), error = %e, "Statement failed");
        DbError::query(e, sql)
    })
}

fn exec_metadata(output: StatementOutput) -> Option<ExecResult> {
    match output {
        StatementOutput::Exec(result) => result,
        StatementOutput::Rows(_) => None,
    }
}
