//! In-memory Data Source
//!
//! A [`DataSource`] that mimics the PostgreSQL one closely enough to run the
//! whole cache in tests: rows, session-scoped advisory locks, infrastructure
//! creation, checkout and round-trip counters, and failure injection.
//! Several data sources built with [`MemoryDataSource::share`] behave like
//! separate processes pointed at the same database. Tables are kept per
//! (schema, table) pair, so a runtime target change lands on a new, empty
//! table until it is created.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::CacheRecord;
use crate::config::{CacheOptions, PoolOptions, TableTarget, TableTargetObserver};
use crate::datasource::{CacheConnection, DataSource, PoolMetrics};
use crate::error::{CacheError, DataSourceError, DataSourceErrorKind, Result};
use crate::time::next_expiration;

type Rows = HashMap<String, CacheRecord>;

// == Shared Database State ==
#[derive(Debug, Default)]
struct Database {
    tables: HashMap<TableTarget, Rows>,
    creations: u32,
    locks: HashMap<i64, u64>,
    dead_sessions: HashSet<u64>,
    deny_lock_privileges: bool,
    failing_checkouts: u32,
    failing_commands: u32,
    round_trips: u64,
    next_session: u64,
}

impl Database {
    fn release_session(&mut self, session: u64) {
        self.locks.retain(|_, owner| *owner != session);
    }

    fn rows(&self, target: &TableTarget) -> Option<&Rows> {
        self.tables.get(target)
    }

    fn rows_mut(&mut self, target: &TableTarget) -> Option<&mut Rows> {
        self.tables.get_mut(target)
    }
}

// == Memory Data Source ==
#[derive(Debug, Clone)]
pub struct MemoryDataSource {
    db: Arc<Mutex<Database>>,
    /// Table this "process" is configured for
    target: Arc<Mutex<TableTarget>>,
    checkouts: Arc<AtomicU64>,
    pool: PoolOptions,
    ddl_delay: Duration,
    command_delay: Arc<Mutex<Duration>>,
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataSource {
    /// An empty database without the cache table, targeting the default table.
    pub fn new() -> Self {
        Self {
            db: Arc::new(Mutex::new(Database::default())),
            target: Arc::new(Mutex::new(CacheOptions::default().target)),
            checkouts: Arc::new(AtomicU64::new(0)),
            pool: PoolOptions::default(),
            ddl_delay: Duration::from_millis(20),
            command_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// An empty database where the cache table already exists.
    pub fn with_infrastructure() -> Self {
        let source = Self::new();
        let target = source.current_target();
        source.db().tables.insert(target, Rows::new());
        source
    }

    /// A second "process" on the same database, with its own pool counters
    /// and its own copy of the current target.
    pub fn share(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            target: Arc::new(Mutex::new(self.current_target())),
            checkouts: Arc::new(AtomicU64::new(0)),
            pool: self.pool.clone(),
            ddl_delay: self.ddl_delay,
            command_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    // == Inspection ==
    pub fn checkouts(&self) -> u64 {
        self.checkouts.load(Ordering::SeqCst)
    }

    pub fn round_trips(&self) -> u64 {
        self.db().round_trips
    }

    /// How many times the infrastructure was actually created.
    pub fn creations(&self) -> u32 {
        self.db().creations
    }

    // The accessors below look at the table of the current target.
    pub fn has_infrastructure(&self) -> bool {
        let target = self.current_target();
        self.db().tables.contains_key(&target)
    }

    pub fn row_count(&self) -> usize {
        let target = self.current_target();
        self.db().rows(&target).map_or(0, HashMap::len)
    }

    pub fn record(&self, key: &str) -> Option<CacheRecord> {
        let target = self.current_target();
        self.db().rows(&target).and_then(|rows| rows.get(key).cloned())
    }

    /// Writes a row directly, creating the table if needed.
    pub fn insert_record(&self, record: CacheRecord) {
        let target = self.current_target();
        self.db()
            .tables
            .entry(target)
            .or_default()
            .insert(record.key.clone(), record);
    }

    pub fn current_target(&self) -> TableTarget {
        self.target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_locked(&self, key: i64) -> bool {
        self.db().locks.contains_key(&key)
    }

    // == Failure Injection ==
    /// Makes advisory lock calls fail with a permission error.
    pub fn deny_lock_privileges(&self) {
        self.db().deny_lock_privileges = true;
    }

    /// The next `n` checkouts fail with a connection error.
    pub fn fail_next_checkouts(&self, n: u32) {
        self.db().failing_checkouts = n;
    }

    /// The next `n` commands fail with a connection error.
    pub fn fail_next_commands(&self, n: u32) {
        self.db().failing_commands = n;
    }

    /// Delays every command of this data source.
    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Terminates every open session, releasing their locks.
    pub fn kill_sessions(&self) {
        let mut db = self.db();
        let live: Vec<u64> = (1..=db.next_session).collect();
        db.dead_sessions.extend(live);
        db.locks.clear();
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn get_connection(&self) -> Result<Box<dyn CacheConnection>> {
        let session = {
            let mut db = self.db();
            if db.failing_checkouts > 0 {
                db.failing_checkouts -= 1;
                return Err(DataSourceError::connection("connection refused").into());
            }
            db.next_session += 1;
            db.next_session
        };
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.command_delay.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Box::new(MemoryConnection {
            session,
            target: self.current_target(),
            db: Arc::clone(&self.db),
            ddl_delay: self.ddl_delay,
            command_delay: delay,
        }))
    }

    fn pool_metrics(&self) -> PoolMetrics {
        PoolMetrics {
            min_size: self.pool.min_size,
            max_size: self.pool.max_size,
            idle_lifetime: self.pool.idle_lifetime,
            pruning_interval: self.pool.pruning_interval,
            pooling_enabled: self.pool.pooling_enabled,
            size: 0,
            idle: 0,
            checkouts: self.checkouts(),
        }
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

impl TableTargetObserver for MemoryDataSource {
    fn on_table_target_changed(&self, target: &TableTarget) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = target.clone();
    }
}

// == Memory Connection ==
struct MemoryConnection {
    session: u64,
    /// Target at checkout time, like the SQL a pooled connection was handed
    target: TableTarget,
    db: Arc<Mutex<Database>>,
    ddl_delay: Duration,
    command_delay: Duration,
}

impl MemoryConnection {
    /// Starts a round trip: applies delay and injected failures, then locks the database.
    async fn begin(&self) -> Result<MutexGuard<'_, Database>> {
        if !self.command_delay.is_zero() {
            tokio::time::sleep(self.command_delay).await;
        }
        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.round_trips += 1;
        if db.dead_sessions.contains(&self.session) {
            return Err(DataSourceError::connection("terminating connection due to administrator command").into());
        }
        if db.failing_commands > 0 {
            db.failing_commands -= 1;
            return Err(DataSourceError::connection("connection reset by peer").into());
        }
        Ok(db)
    }

    async fn begin_table(&self) -> Result<MutexGuard<'_, Database>> {
        let db = self.begin().await?;
        if !db.tables.contains_key(&self.target) {
            return Err(CacheError::DataSource(DataSourceError::new(
                DataSourceErrorKind::Other,
                "relation does not exist",
            )));
        }
        Ok(db)
    }

    fn check_lock_privileges(db: &Database) -> Result<()> {
        if db.deny_lock_privileges {
            return Err(DataSourceError::permission_denied(
                "permission denied for function pg_try_advisory_lock",
            )
            .into());
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.db
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release_session(self.session);
    }
}

#[async_trait]
impl CacheConnection for MemoryConnection {
    async fn fetch(&mut self, keys: &[String], now: DateTime<Utc>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut db = self.begin_table().await?;
        let Some(rows) = db.rows_mut(&self.target) else {
            return Ok(Vec::new());
        };
        let mut hits = Vec::new();
        for key in keys {
            if let Some(record) = rows.get_mut(key) {
                if record.is_expired(now) {
                    continue;
                }
                if record.sliding_interval.is_some() {
                    record.next_expiration =
                        next_expiration(now, record.absolute_expiration, record.sliding_interval);
                }
                hits.push((key.clone(), record.value.clone()));
            }
        }
        Ok(hits)
    }

    async fn upsert(&mut self, records: &[CacheRecord]) -> Result<u64> {
        let mut db = self.begin_table().await?;
        if let Some(rows) = db.rows_mut(&self.target) {
            for record in records {
                rows.insert(record.key.clone(), record.clone());
            }
        }
        Ok(records.len() as u64)
    }

    async fn delete(&mut self, keys: &[String]) -> Result<u64> {
        let mut db = self.begin_table().await?;
        let Some(rows) = db.rows_mut(&self.target) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|key| rows.remove(*key).is_some()).count() as u64)
    }

    async fn refresh(&mut self, keys: &[String], now: DateTime<Utc>) -> Result<u64> {
        let mut db = self.begin_table().await?;
        let Some(rows) = db.rows_mut(&self.target) else {
            return Ok(0);
        };
        let mut refreshed = 0;
        for key in keys {
            if let Some(record) = rows.get_mut(key) {
                if record.sliding_interval.is_some() && !record.is_expired(now) {
                    record.next_expiration =
                        next_expiration(now, record.absolute_expiration, record.sliding_interval);
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }

    async fn delete_expired(&mut self, now: DateTime<Utc>, limit: u32) -> Result<u64> {
        let mut db = self.begin_table().await?;
        let Some(rows) = db.rows_mut(&self.target) else {
            return Ok(0);
        };
        let mut expired: Vec<(DateTime<Utc>, String)> = rows
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| (record.next_expiration, record.key.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit as usize);
        for (_, key) in &expired {
            rows.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool> {
        let mut db = self.begin().await?;
        Self::check_lock_privileges(&db)?;
        match db.locks.get(&key) {
            Some(owner) => Ok(*owner == self.session),
            None => {
                db.locks.insert(key, self.session);
                Ok(true)
            }
        }
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<bool> {
        let mut db = self.begin().await?;
        Self::check_lock_privileges(&db)?;
        if db.locks.get(&key) == Some(&self.session) {
            db.locks.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn infrastructure_exists(&mut self) -> Result<bool> {
        Ok(self.begin().await?.tables.contains_key(&self.target))
    }

    async fn create_infrastructure(&mut self) -> Result<()> {
        drop(self.begin().await?);
        // DDL takes a while; other sessions can observe the lock in the meantime
        tokio::time::sleep(self.ddl_delay).await;
        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        if !db.tables.contains_key(&self.target) {
            db.tables.insert(self.target.clone(), Rows::new());
            db.creations += 1;
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.begin().await.map(drop)
    }
}
