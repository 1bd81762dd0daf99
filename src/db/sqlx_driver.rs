//! sqlx-backed driver for MySQL and SQLite.
//!
//! Pools are created lazily: no connection is opened until the first checkout, so
//! building a pool (including a rebuild after connection loss) never blocks.
//! Failed checkouts, and connection-lost errors seen while a lease is in use, are
//! reported on the pool's event channel.

use crate::config::PoolConfig;
use crate::db::driver::{
    AcquireFailure, Driver, DriverConnection, DriverError, DriverErrorKind, DriverPool,
    DriverResult, PoolEventSender,
};
use crate::db::params::{bind_mysql_param, bind_sqlite_param};
use crate::db::types::RowToJson;
use crate::models::{DatabaseType, ExecResult, QueryParam, Row};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::mysql::{
    MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlPoolOptions, MySqlRow,
    MySqlSslMode,
};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, MySql, MySqlPool, Sqlite, SqlitePool};
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// MySQL client errors that mean the server link is gone:
/// CR_SERVER_GONE_ERROR, CR_SERVER_LOST and ER_CLIENT_INTERACTION_TIMEOUT.
const MYSQL_CONNECTION_LOST_ERRORS: [u16; 3] = [2006, 2013, 4031];

/// The production [`Driver`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxDriver;

impl Driver for SqlxDriver {
    fn name(&self) -> &'static str {
        "sqlx"
    }

    fn create_pool(
        &self,
        config: &PoolConfig,
        events: PoolEventSender,
    ) -> DriverResult<Arc<dyn DriverPool>> {
        let db_type = config
            .resolved_db_type()
            .map_err(|e| DriverError::new(DriverErrorKind::Pool, None, e.to_string()))?;

        let pool = match db_type {
            DatabaseType::MySQL => DbPool::MySql(mysql_pool(config)?),
            DatabaseType::SQLite => DbPool::SQLite(sqlite_pool(config)?),
        };

        Ok(Arc::new(SqlxPool { pool, events }))
    }
}

fn config_error(message: String) -> DriverError {
    DriverError::new(DriverErrorKind::Pool, None, message)
}

/// Pass-through keys understood by the MySQL connect options.
const MYSQL_OPTION_KEYS: &[&str] = &[
    "charset",
    "collation",
    "timezone",
    "ssl_mode",
    "ssl_ca",
    "socket",
    "statement_cache_capacity",
];

/// Pass-through keys understood by the SQLite connect options.
const SQLITE_OPTION_KEYS: &[&str] = &[
    "journal_mode",
    "foreign_keys",
    "busy_timeout",
    "read_only",
    "create_if_missing",
    "statement_cache_capacity",
];

fn mysql_pool(config: &PoolConfig) -> DriverResult<MySqlPool> {
    let options = mysql_connect_options(config)?;
    let pool_opts = &config.pool_options;
    Ok(MySqlPoolOptions::new()
        .min_connections(pool_opts.min_connections_or_default())
        .max_connections(pool_opts.max_connections_or_default(false))
        .acquire_timeout(pool_opts.acquire_timeout_or_default())
        .idle_timeout(Some(pool_opts.idle_timeout_or_default()))
        .test_before_acquire(pool_opts.test_before_acquire_or_default())
        .connect_lazy_with(options))
}

fn mysql_connect_options(config: &PoolConfig) -> DriverResult<MySqlConnectOptions> {
    let mut options = match &config.url {
        Some(url) => MySqlConnectOptions::from_str(url)
            .map_err(|e| config_error(format!("Invalid MySQL connection string: {e}")))?,
        None => MySqlConnectOptions::new(),
    };
    if let Some(host) = &config.host {
        options = options.host(host);
    }
    if let Some(port) = config.port {
        options = options.port(port);
    }
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }

    let extra = ExtraOptions::new(config, MYSQL_OPTION_KEYS);
    // sqlx defaults to utf8mb4
    if let Some(charset) = extra.string("charset")? {
        options = options.charset(charset);
    }
    if let Some(collation) = extra.string("collation")? {
        options = options.collation(collation);
    }
    if let Some(timezone) = extra.string("timezone")? {
        options = options.timezone(Some(timezone.to_string()));
    }
    if let Some(mode) = extra.string("ssl_mode")? {
        let mode = MySqlSslMode::from_str(mode)
            .map_err(|e| config_error(format!("Invalid ssl_mode '{mode}': {e}")))?;
        options = options.ssl_mode(mode);
    }
    if let Some(ca) = extra.string("ssl_ca")? {
        options = options.ssl_ca(ca);
    }
    if let Some(socket) = extra.string("socket")? {
        options = options.socket(socket);
    }
    if let Some(capacity) = extra.unsigned("statement_cache_capacity")? {
        options = options.statement_cache_capacity(capacity as usize);
    }
    Ok(options)
}

fn sqlite_pool(config: &PoolConfig) -> DriverResult<SqlitePool> {
    let options = sqlite_connect_options(config)?;
    let pool_opts = &config.pool_options;
    Ok(SqlitePoolOptions::new()
        .min_connections(pool_opts.min_connections_or_default())
        .max_connections(pool_opts.max_connections_or_default(true))
        .acquire_timeout(pool_opts.acquire_timeout_or_default())
        .idle_timeout(Some(pool_opts.idle_timeout_or_default()))
        .test_before_acquire(pool_opts.test_before_acquire_or_default())
        .connect_lazy_with(options))
}

fn sqlite_connect_options(config: &PoolConfig) -> DriverResult<SqliteConnectOptions> {
    let mut options = match (&config.url, &config.database) {
        (Some(url), _) => SqliteConnectOptions::from_str(url)
            .map_err(|e| config_error(format!("Invalid SQLite connection string: {e}")))?,
        (None, Some(path)) => SqliteConnectOptions::new().filename(path),
        (None, None) => {
            return Err(config_error(
                "SQLite requires a url or a database file path".to_string(),
            ));
        }
    };

    let extra = ExtraOptions::new(config, SQLITE_OPTION_KEYS);
    options = options.create_if_missing(extra.boolean("create_if_missing")?.unwrap_or(true));
    if let Some(mode) = extra.string("journal_mode")? {
        let mode = SqliteJournalMode::from_str(mode)
            .map_err(|e| config_error(format!("Invalid journal_mode '{mode}': {e}")))?;
        options = options.journal_mode(mode);
    }
    if let Some(on) = extra.boolean("foreign_keys")? {
        options = options.foreign_keys(on);
    }
    if let Some(read_only) = extra.boolean("read_only")? {
        options = options.read_only(read_only);
    }
    if let Some(secs) = extra.unsigned("busy_timeout")? {
        options = options.busy_timeout(Duration::from_secs(secs));
    }
    if let Some(capacity) = extra.unsigned("statement_cache_capacity")? {
        options = options.statement_cache_capacity(capacity as usize);
    }
    Ok(options)
}

/// Typed access to the configuration keys passed through to the driver.
struct ExtraOptions<'a> {
    values: &'a serde_json::Map<String, JsonValue>,
}

impl<'a> ExtraOptions<'a> {
    /// Keys outside `known` are logged and otherwise ignored.
    fn new(config: &'a PoolConfig, known: &[&str]) -> Self {
        for key in config.extra.keys() {
            if !known.contains(&key.as_str()) {
                warn!(key = %key, "Ignoring pool configuration key the driver does not use");
            }
        }
        Self {
            values: &config.extra,
        }
    }

    fn string(&self, key: &str) -> DriverResult<Option<&'a str>> {
        match self.values.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(invalid_option(key, "a string", other)),
        }
    }

    fn boolean(&self, key: &str) -> DriverResult<Option<bool>> {
        match self.values.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(invalid_option(key, "a boolean", other)),
        }
    }

    fn unsigned(&self, key: &str) -> DriverResult<Option<u64>> {
        match self.values.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid_option(key, "a non-negative integer", value)),
        }
    }
}

fn invalid_option(key: &str, expected: &str, got: &JsonValue) -> DriverError {
    config_error(format!("Pool option '{key}' must be {expected}, got {got}"))
}

/// Database-specific connection pool.
#[derive(Debug, Clone)]
enum DbPool {
    MySql(MySqlPool),
    SQLite(SqlitePool),
}

#[derive(Debug)]
struct SqlxPool {
    pool: DbPool,
    events: PoolEventSender,
}

#[async_trait]
impl DriverPool for SqlxPool {
    async fn get_connection(&self) -> Result<Option<Box<dyn DriverConnection>>, AcquireFailure> {
        let result = match &self.pool {
            DbPool::MySql(pool) => pool.acquire().await.map(LeasedConnection::MySql),
            DbPool::SQLite(pool) => pool.acquire().await.map(LeasedConnection::SQLite),
        };

        match result {
            Ok(conn) => Ok(Some(Box::new(SqlxLease {
                conn,
                events: self.events.clone(),
            }))),
            Err(e) => {
                let error = DriverError::from(e);
                self.events.report(error.clone());
                Err(AcquireFailure::new(error))
            }
        }
    }
}

#[derive(Debug)]
enum LeasedConnection {
    MySql(PoolConnection<MySql>),
    SQLite(PoolConnection<Sqlite>),
}

#[derive(Debug)]
struct SqlxLease {
    conn: LeasedConnection,
    events: PoolEventSender,
}

impl SqlxLease {
    /// Classify a sqlx error and forward connection loss to the pool observer.
    fn observe<T>(&self, result: Result<T, sqlx::Error>) -> DriverResult<T> {
        result.map_err(|e| {
            let error = DriverError::from(e);
            if error.is_connection_lost() {
                self.events.report(error.clone());
            }
            error
        })
    }

    async fn run_command(&mut self, sql: &'static str) -> DriverResult<()> {
        let result = match &mut self.conn {
            LeasedConnection::MySql(conn) => (&mut **conn).execute(sql).await.map(|_| ()),
            LeasedConnection::SQLite(conn) => (&mut **conn).execute(sql).await.map(|_| ()),
        };
        self.observe(result)
    }

    fn db_type(&self) -> DatabaseType {
        match self.conn {
            LeasedConnection::MySql(_) => DatabaseType::MySQL,
            LeasedConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

#[async_trait]
impl DriverConnection for SqlxLease {
    async fn fetch(&mut self, sql: &str, params: &[QueryParam]) -> DriverResult<Vec<Row>> {
        let result = match &mut self.conn {
            LeasedConnection::MySql(conn) => fetch_mysql(conn, sql, params).await,
            LeasedConnection::SQLite(conn) => fetch_sqlite(conn, sql, params).await,
        };
        self.observe(result)
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DriverResult<Option<ExecResult>> {
        let result = match &mut self.conn {
            LeasedConnection::MySql(conn) => execute_mysql(conn, sql, params).await,
            LeasedConnection::SQLite(conn) => execute_sqlite(conn, sql, params).await,
        };
        self.observe(result).map(Some)
    }

    async fn begin_transaction(&mut self) -> DriverResult<()> {
        let statement = self.db_type().begin_statement();
        self.run_command(statement).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.run_command("COMMIT").await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.run_command("ROLLBACK").await
    }

    async fn release(self: Box<Self>) {
        // Dropping a PoolConnection hands it back to its pool
        drop(self);
    }

    async fn discard(self: Box<Self>) {
        // The pool opens a replacement on demand
        let result = match self.conn {
            LeasedConnection::MySql(conn) => conn.close().await,
            LeasedConnection::SQLite(conn) => conn.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Error while closing discarded connection");
        }
    }
}

// Statements without parameters go through the unprepared text protocol so that
// commands the prepared-statement protocol rejects still work.

async fn fetch_mysql(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<Vec<Row>, sqlx::Error> {
    let rows: Vec<MySqlRow> = if params.is_empty() {
        conn.fetch_all(sql).await?
    } else {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        query.fetch_all(conn).await?
    };
    Ok(rows.iter().map(RowToJson::to_json_map).collect())
}

async fn fetch_sqlite(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<Vec<Row>, sqlx::Error> {
    let rows: Vec<SqliteRow> = if params.is_empty() {
        conn.fetch_all(sql).await?
    } else {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        query.fetch_all(conn).await?
    };
    Ok(rows.iter().map(RowToJson::to_json_map).collect())
}

async fn execute_mysql(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<ExecResult, sqlx::Error> {
    let result = if params.is_empty() {
        conn.execute(sql).await?
    } else {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        query.execute(conn).await?
    };
    Ok(ExecResult {
        insert_id: Some(result.last_insert_id()),
        affected_rows: result.rows_affected(),
    })
}

async fn execute_sqlite(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[QueryParam],
) -> Result<ExecResult, sqlx::Error> {
    let result = if params.is_empty() {
        conn.execute(sql).await?
    } else {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        query.execute(conn).await?
    };
    Ok(ExecResult {
        insert_id: u64::try_from(result.last_insert_rowid()).ok(),
        affected_rows: result.rows_affected(),
    })
}

fn is_connection_lost_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(io_err) if is_connection_lost_io(io_err) => {
                DriverError::connection_lost(format!("Connection lost: {io_err}"))
            }
            sqlx::Error::Io(io_err) => {
                DriverError::new(DriverErrorKind::Other, None, format!("I/O error: {io_err}"))
            }
            sqlx::Error::Database(db_err) => {
                if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
                    let number = mysql_err.number();
                    if MYSQL_CONNECTION_LOST_ERRORS.contains(&number) {
                        return DriverError::connection_lost(format!(
                            "Connection lost: {}",
                            db_err.message()
                        ));
                    }
                    return DriverError::database(Some(number.to_string()), db_err.message());
                }
                DriverError::database(db_err.code().map(|c| c.to_string()), db_err.message())
            }
            sqlx::Error::PoolTimedOut => DriverError::new(
                DriverErrorKind::Timeout,
                None,
                "Timed out waiting for a pooled connection",
            ),
            sqlx::Error::PoolClosed => {
                DriverError::new(DriverErrorKind::Pool, None, "Connection pool is closed")
            }
            sqlx::Error::Configuration(msg) => {
                DriverError::new(DriverErrorKind::Pool, None, msg.to_string())
            }
            _ => DriverError::other(err.to_string()),
        }
    }
}
