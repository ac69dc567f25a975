//! Distributed Cache Engine
//!
//! Key/value operations over a [`DataSource`]. Every call, single-key or
//! batch, acquires one connection per attempt and issues one statement, so a
//! batch either applies as a whole or fails as a whole.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::serializer::{Serializer, ValueSerializer};
use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheRecord, CacheStats, ExpirationPolicy, MAX_KEY_LENGTH};
use crate::config::{CacheOptions, TableTarget, TableTargetObserver};
use crate::datasource::{DataSource, PoolMetrics};
use crate::error::{CacheError, Result};
use crate::infrastructure::{EnsureOutcome, SchemaManager};
use crate::resilience::{CircuitState, ResiliencePipeline};
use crate::time::{ExpirationConverter, SharedClock};

// == Cache Item ==
/// One entry of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub value: Vec<u8>,
    pub policy: ExpirationPolicy,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, policy: ExpirationPolicy) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            policy,
        }
    }
}

/// A single round trip, owned so it can be replayed on retry.
enum Command {
    Fetch(Vec<String>),
    Upsert(Vec<CacheRecord>),
    Delete(Vec<String>),
    Refresh(Vec<String>),
}

impl Command {
    fn key_count(&self) -> usize {
        match self {
            Self::Fetch(keys) | Self::Delete(keys) | Self::Refresh(keys) => keys.len(),
            Self::Upsert(records) => records.len(),
        }
    }
}

enum Reply {
    Rows(Vec<(String, Vec<u8>)>),
    Affected(u64),
}

impl Reply {
    fn into_rows(self) -> Vec<(String, Vec<u8>)> {
        match self {
            Self::Rows(rows) => rows,
            Self::Affected(_) => Vec::new(),
        }
    }
}

// == Distributed Cache ==
pub struct DistributedCache {
    source: Arc<dyn DataSource>,
    pipeline: ResiliencePipeline,
    converter: ExpirationConverter,
    schema: SchemaManager,
    serializer: Serializer,
    default_sliding: Option<Duration>,
    stats: StatsRecorder,
}

impl DistributedCache {
    /// Creates a cache over `source`.
    ///
    /// Nothing is sent to the database here; the table is ensured lazily on
    /// first use or by [`DistributedCache::ensure_infrastructure`].
    ///
    /// # Arguments
    /// * `options` - Validated (except for the connection string) before use
    /// * `source` - Data source holding the cache table
    /// * `clock` - Time source for every expiration computation
    pub fn new(options: &CacheOptions, source: Arc<dyn DataSource>, clock: SharedClock) -> Result<Self> {
        options.validate_without_connection()?;

        Ok(Self {
            pipeline: ResiliencePipeline::new(options.resilience.clone(), source.target()),
            converter: ExpirationConverter::new(clock, options.min_expiration, options.max_expiration),
            schema: SchemaManager::new(options, Arc::clone(&source)),
            serializer: Serializer::from(options.serializer),
            default_sliding: options.default_sliding_expiration,
            stats: StatsRecorder::default(),
            source,
        })
    }

    // == Single-key Operations ==
    /// Returns the value if the key is live, extending its sliding expiration.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let mut rows = self.fetch("get", vec![key.to_string()]).await?;
        Ok(rows.pop().map(|(_, value)| value))
    }

    /// Inserts or replaces `key`.
    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>, policy: &ExpirationPolicy) -> Result<()> {
        self.write("set", key, value.into(), policy, None).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.execute("remove", Command::Delete(vec![key.to_string()])).await?;
        self.stats.record_removals(1);
        Ok(())
    }

    /// Extends the sliding expiration of `key` without reading its value.
    pub async fn refresh(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.execute("refresh", Command::Refresh(vec![key.to_string()])).await?;
        Ok(())
    }

    // == Batch Operations ==
    /// Returns the live subset of `keys`. Missing and expired keys are absent.
    pub async fn get_multiple<I, K>(&self, keys: I) -> Result<HashMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = unique_keys(keys)?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self.fetch("get_multiple", keys).await?.into_iter().collect())
    }

    /// Writes every item in one statement. Later duplicates of a key win.
    pub async fn set_multiple<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = CacheItem>,
    {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut records: Vec<CacheRecord> = Vec::new();
        for item in items {
            validate_key(&item.key)?;
            let record = self.to_record(item.key, item.value, &item.policy, None)?;
            match positions.get(&record.key) {
                Some(&index) => records[index] = record,
                None => {
                    positions.insert(record.key.clone(), records.len());
                    records.push(record);
                }
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let count = records.len();
        self.execute("set_multiple", Command::Upsert(records)).await?;
        self.stats.record_writes(count);
        Ok(())
    }

    pub async fn remove_multiple<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = unique_keys(keys)?;
        if keys.is_empty() {
            return Ok(());
        }
        let count = keys.len();
        self.execute("remove_multiple", Command::Delete(keys)).await?;
        self.stats.record_removals(count);
        Ok(())
    }

    pub async fn refresh_multiple<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys = unique_keys(keys)?;
        if keys.is_empty() {
            return Ok(());
        }
        self.execute("refresh_multiple", Command::Refresh(keys)).await?;
        Ok(())
    }

    // == Typed Helpers ==
    /// Reads a UTF-8 value. Non UTF-8 bytes read as a miss.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key).await?.and_then(|bytes| match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "Cached value is not valid UTF-8");
                None
            }
        }))
    }

    pub async fn set_string(&self, key: &str, value: &str, policy: &ExpirationPolicy) -> Result<()> {
        self.write("set", key, value.as_bytes().to_vec(), policy, None).await
    }

    /// Reads and deserializes a value with the configured serializer.
    /// A value that fails to deserialize reads as a miss.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get(key).await? else {
            return Ok(None);
        };
        match self.serializer.deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, error = %err, expected = std::any::type_name::<T>(), "Discarding undecodable cache value");
                Ok(None)
            }
        }
    }

    /// Serializes `value` with the configured serializer and writes it,
    /// recording the Rust type name as the value type.
    pub async fn set_typed<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        policy: &ExpirationPolicy,
    ) -> Result<()> {
        let bytes = self.serializer.serialize(value)?;
        let value_type = std::any::type_name::<T>().to_string();
        self.write("set", key, bytes, policy, Some(value_type)).await
    }

    // == Maintenance ==
    /// Creates the cache table if needed. Called implicitly on first use.
    pub async fn ensure_infrastructure(&self) -> Result<EnsureOutcome> {
        self.schema.ensure().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.source.pool_metrics()
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.pipeline.circuit_state()
    }

    pub fn table_target(&self) -> TableTarget {
        self.schema.target()
    }

    // == Internals ==
    async fn write(
        &self,
        operation: &'static str,
        key: &str,
        value: Vec<u8>,
        policy: &ExpirationPolicy,
        value_type: Option<String>,
    ) -> Result<()> {
        validate_key(key)?;
        let record = self.to_record(key.to_string(), value, policy, value_type)?;
        self.execute(operation, Command::Upsert(vec![record])).await?;
        self.stats.record_writes(1);
        Ok(())
    }

    fn to_record(
        &self,
        key: String,
        value: Vec<u8>,
        policy: &ExpirationPolicy,
        value_type: Option<String>,
    ) -> Result<CacheRecord> {
        let expiration = self.converter.resolve(policy, self.default_sliding)?;
        Ok(CacheRecord::new(key, value, expiration, value_type))
    }

    async fn fetch(&self, operation: &'static str, keys: Vec<String>) -> Result<Vec<(String, Vec<u8>)>> {
        let requested = keys.len();
        let rows = self.execute(operation, Command::Fetch(keys)).await?.into_rows();
        self.stats.record_reads(rows.len(), requested.saturating_sub(rows.len()));
        Ok(rows)
    }

    async fn execute(&self, operation: &'static str, command: Command) -> Result<Reply> {
        self.schema.ensure().await?;
        debug!(operation, key_count = command.key_count(), "Executing cache command");
        let command = &command;
        self.pipeline
            .execute(operation, move || self.attempt(operation, command))
            .await
    }

    async fn attempt(&self, operation: &'static str, command: &Command) -> Result<Reply> {
        let mut conn = self
            .pipeline
            .with_connection_timeout(operation, self.source.get_connection())
            .await?;
        let now = self.converter.now();
        let round_trip = async {
            match command {
                Command::Fetch(keys) => conn.fetch(keys, now).await.map(Reply::Rows),
                Command::Upsert(records) => conn.upsert(records).await.map(Reply::Affected),
                Command::Delete(keys) => conn.delete(keys).await.map(Reply::Affected),
                Command::Refresh(keys) => conn.refresh(keys, now).await.map(Reply::Affected),
            }
        };
        self.pipeline.with_command_timeout(operation, round_trip).await
    }
}

impl TableTargetObserver for DistributedCache {
    /// Points the cache at another table. The data source regenerates its
    /// statements and the new table is ensured on the next call.
    fn on_table_target_changed(&self, target: &TableTarget) {
        if let Err(err) = target.validate() {
            warn!(to = %target, error = %err, "Ignoring invalid cache table change");
            return;
        }
        self.source.on_table_target_changed(target);
        self.schema.on_table_target_changed(target);
    }
}

// == Key Validation ==
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("cache key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidArgument(format!(
            "cache key is {} bytes, maximum is {MAX_KEY_LENGTH}",
            key.len()
        )));
    }
    Ok(())
}

/// Validates and deduplicates keys, keeping first-seen order.
fn unique_keys<I, K>(keys: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for key in keys {
        let key = key.into();
        validate_key(&key)?;
        if seen.insert(key.clone()) {
            unique.push(key);
        }
    }
    Ok(unique)
}
