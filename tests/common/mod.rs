//! Scripted in-memory driver shared by the integration tests.
//!
//! Every call the pool manager or executor makes is counted, and each step can be
//! told to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use db_pool_executor::config::PoolConfig;
use db_pool_executor::db::{
    AcquireFailure, Driver, DriverConnection, DriverError, DriverPool, DriverResult,
    PoolEventSender, PoolManager, QueryExecutor,
};
use db_pool_executor::models::{ExecResult, QueryParam, Row};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct Counters {
    pub pools_created: AtomicUsize,
    pub acquisitions: AtomicUsize,
    pub releases: AtomicUsize,
    pub discards: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub statements: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Behaviour knobs. Change them through [`MockDriver::script`].
#[derive(Debug, Clone)]
pub struct Script {
    pub fail_create_pool: bool,
    pub fail_acquire: Option<DriverError>,
    /// Hand a half-open connection back alongside the acquire error.
    pub partial_connection_on_failure: bool,
    /// Return neither a connection nor an error.
    pub acquire_returns_nothing: bool,
    pub fail_begin: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    /// Statements containing this text fail.
    pub fail_sql_containing: Option<String>,
    pub exec_result: Option<ExecResult>,
    pub rows: Vec<Row>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_create_pool: false,
            fail_acquire: None,
            partial_connection_on_failure: false,
            acquire_returns_nothing: false,
            fail_begin: false,
            fail_commit: false,
            fail_rollback: false,
            fail_sql_containing: None,
            exec_result: Some(ExecResult {
                insert_id: Some(42),
                affected_rows: 1,
            }),
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockDriver {
    pub counters: Counters,
    script: Mutex<Script>,
    senders: Mutex<Vec<PoolEventSender>>,
    executed: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.script.lock().unwrap());
    }

    fn current_script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }

    /// Event sender handed to the most recently created pool.
    pub fn latest_sender(&self) -> PoolEventSender {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }

    /// Event sender handed to the pool of the given generation.
    pub fn sender_for(&self, generation: u64) -> PoolEventSender {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.generation() == generation)
            .cloned()
            .unwrap()
    }

    /// SQL of every statement executed, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn pools_created(&self) -> usize {
        Counters::get(&self.counters.pools_created)
    }

    pub fn acquisitions(&self) -> usize {
        Counters::get(&self.counters.acquisitions)
    }

    pub fn releases(&self) -> usize {
        Counters::get(&self.counters.releases)
    }

    pub fn discards(&self) -> usize {
        Counters::get(&self.counters.discards)
    }

    pub fn begins(&self) -> usize {
        Counters::get(&self.counters.begins)
    }

    pub fn commits(&self) -> usize {
        Counters::get(&self.counters.commits)
    }

    pub fn rollbacks(&self) -> usize {
        Counters::get(&self.counters.rollbacks)
    }
}

/// `Driver` is implemented on a newtype so tests keep their own `Arc<MockDriver>`.
#[derive(Debug)]
pub struct SharedMockDriver(pub Arc<MockDriver>);

impl Driver for SharedMockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_pool(
        &self,
        _config: &PoolConfig,
        events: PoolEventSender,
    ) -> DriverResult<Arc<dyn DriverPool>> {
        if self.0.current_script().fail_create_pool {
            return Err(DriverError::other("scripted pool creation failure"));
        }
        self.0.counters.pools_created.fetch_add(1, Ordering::SeqCst);
        let generation = events.generation();
        self.0.senders.lock().unwrap().push(events);
        Ok(Arc::new(MockPool {
            driver: Arc::clone(&self.0),
            generation,
        }))
    }
}

#[derive(Debug)]
struct MockPool {
    driver: Arc<MockDriver>,
    generation: u64,
}

#[async_trait]
impl DriverPool for MockPool {
    async fn get_connection(&self) -> Result<Option<Box<dyn DriverConnection>>, AcquireFailure> {
        let script = self.driver.current_script();
        self.driver.counters.acquisitions.fetch_add(1, Ordering::SeqCst);

        let conn = || -> Box<dyn DriverConnection> {
            Box::new(MockConnection {
                driver: Arc::clone(&self.driver),
                generation: self.generation,
            })
        };

        if let Some(error) = script.fail_acquire {
            if script.partial_connection_on_failure {
                return Err(AcquireFailure::with_connection(error, conn()));
            }
            return Err(AcquireFailure::new(error));
        }
        if script.acquire_returns_nothing {
            return Ok(None);
        }
        Ok(Some(conn()))
    }
}

#[derive(Debug)]
pub struct MockConnection {
    driver: Arc<MockDriver>,
    pub generation: u64,
}

impl MockConnection {
    fn record(&self, sql: &str) -> DriverResult<Script> {
        let script = self.driver.current_script();
        self.driver.counters.statements.fetch_add(1, Ordering::SeqCst);
        self.driver.executed.lock().unwrap().push(sql.to_string());
        if let Some(needle) = &script.fail_sql_containing {
            if sql.contains(needle.as_str()) {
                return Err(DriverError::database(
                    Some("1064".to_string()),
                    format!("scripted failure for: {sql}"),
                ));
            }
        }
        Ok(script)
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn fetch(&mut self, sql: &str, _params: &[QueryParam]) -> DriverResult<Vec<Row>> {
        Ok(self.record(sql)?.rows)
    }

    async fn execute(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
    ) -> DriverResult<Option<ExecResult>> {
        Ok(self.record(sql)?.exec_result)
    }

    async fn begin_transaction(&mut self) -> DriverResult<()> {
        self.driver.counters.begins.fetch_add(1, Ordering::SeqCst);
        if self.driver.current_script().fail_begin {
            return Err(DriverError::database(None, "scripted begin failure"));
        }
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.driver.counters.commits.fetch_add(1, Ordering::SeqCst);
        if self.driver.current_script().fail_commit {
            return Err(DriverError::database(
                Some("1213".to_string()),
                "scripted commit failure",
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.driver.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.driver.current_script().fail_rollback {
            return Err(DriverError::other("scripted rollback failure"));
        }
        Ok(())
    }

    async fn release(self: Box<Self>) {
        self.driver.counters.releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn discard(self: Box<Self>) {
        self.driver.counters.discards.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn mysql_config() -> serde_json::Value {
    json!({
        "host": "db.internal",
        "port": 3306,
        "user": "app",
        "password": "secret",
        "database": "shop",
        "connection_limit": 5
    })
}

/// Pool manager and executor over a fresh scripted driver.
pub fn setup() -> (Arc<MockDriver>, Arc<PoolManager>, QueryExecutor) {
    let driver = MockDriver::new();
    let manager = PoolManager::initialize(
        mysql_config(),
        Arc::new(SharedMockDriver(Arc::clone(&driver))),
    )
    .expect("valid configuration");
    let executor = QueryExecutor::new(Arc::clone(&manager));
    (driver, manager, executor)
}

/// Let the pool observer task drain its channel.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
