//! Data Source Module
//!
//! Pooled connection acquisition behind a small trait seam. The cache engine,
//! the infrastructure manager and the election service only ever talk to a
//! [`DataSource`] and the [`CacheConnection`]s it hands out, so the same code
//! runs against PostgreSQL and against the in-memory double used in tests.

mod masking;
mod memory;
mod postgres;
mod sql;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::cache::CacheRecord;
use crate::config::{TableTarget, TableTargetObserver};
use crate::error::Result;

pub use masking::mask_connection_string;
pub use memory::MemoryDataSource;
pub use postgres::{classify_sqlstate, PgDataSource};
pub use sql::SqlCommands;

// == Pool Metrics ==
/// Read-only snapshot of the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMetrics {
    pub min_size: u32,
    pub max_size: u32,
    pub idle_lifetime: Duration,
    pub pruning_interval: Duration,
    pub pooling_enabled: bool,
    /// Connections currently open
    pub size: u32,
    /// Open connections not checked out
    pub idle: u32,
    /// Total successful checkouts since construction
    pub checkouts: u64,
}

// == Data Source Trait ==
/// Connections handed out after a table change use the new table.
#[async_trait]
pub trait DataSource: TableTargetObserver + 'static {
    /// Checks a connection out of the pool.
    async fn get_connection(&self) -> Result<Box<dyn CacheConnection>>;

    fn pool_metrics(&self) -> PoolMetrics;

    /// Human-readable description of the database with secrets masked.
    fn target(&self) -> String;
}

// == Cache Connection Trait ==
/// One checked-out session. Every method is a single round trip.
///
/// Row operations are set-oriented: single-key calls pass one key, batch
/// calls pass all keys, and both cost one round trip.
#[async_trait]
pub trait CacheConnection: Send {
    /// Returns `(key, value)` for every live key and extends sliding expirations of the hits.
    async fn fetch(&mut self, keys: &[String], now: DateTime<Utc>) -> Result<Vec<(String, Vec<u8>)>>;

    /// Inserts or replaces whole records.
    async fn upsert(&mut self, records: &[CacheRecord]) -> Result<u64>;

    async fn delete(&mut self, keys: &[String]) -> Result<u64>;

    /// Recomputes `next_expiration` of live sliding entries.
    async fn refresh(&mut self, keys: &[String], now: DateTime<Utc>) -> Result<u64>;

    /// Deletes at most `limit` rows whose `next_expiration <= now`.
    async fn delete_expired(&mut self, now: DateTime<Utc>, limit: u32) -> Result<u64>;

    /// Non-blocking session-scoped advisory lock.
    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool>;

    async fn advisory_unlock(&mut self, key: i64) -> Result<bool>;

    /// Returns true once the cache table is visible.
    async fn infrastructure_exists(&mut self) -> Result<bool>;

    /// Creates schema, table and index if they do not exist.
    async fn create_infrastructure(&mut self) -> Result<()>;

    async fn ping(&mut self) -> Result<()>;
}

// == Advisory Lock Keys ==
/// What an advisory lock coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    /// Manager election; keyed by hash(schema, table)
    Election,
    /// Schema/table bootstrap
    Infrastructure,
}

/// Deterministic advisory lock key for a table, identical across processes.
pub fn advisory_lock_key(target: &TableTarget, purpose: LockPurpose) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(target.schema.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.table.as_bytes());
    if purpose == LockPurpose::Infrastructure {
        hasher.update(b"\0infrastructure");
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_deterministic() {
        let target = TableTarget::new("public", "cache_entries");
        assert_eq!(
            advisory_lock_key(&target, LockPurpose::Election),
            advisory_lock_key(&target.clone(), LockPurpose::Election)
        );
    }

    #[test]
    fn test_lock_key_differs_per_table_and_purpose() {
        let a = TableTarget::new("public", "cache_entries");
        let b = TableTarget::new("public", "sessions");
        let c = TableTarget::new("publi", "ccache_entries");

        let election = advisory_lock_key(&a, LockPurpose::Election);
        assert_ne!(election, advisory_lock_key(&b, LockPurpose::Election));
        assert_ne!(election, advisory_lock_key(&c, LockPurpose::Election));
        assert_ne!(election, advisory_lock_key(&a, LockPurpose::Infrastructure));
    }
}
