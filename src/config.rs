//! Configuration Module
//!
//! Handles loading and validating the cache configuration from environment
//! variables. A [`CacheOptions`] value is an immutable snapshot; the few
//! fields that may change at runtime (the schema/table pair) are pushed to
//! interested components through [`TableTargetObserver`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{warn, Level};

use crate::cache::SerializerKind;
use crate::error::{CacheError, Result};
use crate::resilience::BackoffStrategy;

/// Unquoted PostgreSQL identifier, at most 63 bytes.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern"));

const ENV_PREFIX: &str = "PGCACHE_";

// == Table Target ==
/// The (schema, table) pair a cache instance operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableTarget {
    pub schema: String,
    pub table: String,
}

impl TableTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Checks both names against the identifier rules.
    pub fn validate(&self) -> Result<()> {
        validate_identifier("schema name", &self.schema)?;
        validate_identifier("table name", &self.table)
    }

    /// Returns the double-quoted, schema-qualified table name.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

impl std::fmt::Display for TableTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

// == Table Target Observer ==
/// Receives runtime changes of the (schema, table) pair.
pub trait TableTargetObserver: Send + Sync {
    fn on_table_target_changed(&self, target: &TableTarget);
}

// == Pool Options ==
/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_size: u32,
    pub max_size: u32,
    /// How long a connection may sit idle before it is closed
    pub idle_lifetime: Duration,
    /// How often idle connections are pruned
    pub pruning_interval: Duration,
    pub pooling_enabled: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_lifetime: Duration::from_secs(300),
            pruning_interval: Duration::from_secs(10),
            pooling_enabled: true,
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(CacheError::Configuration(
                "pool max size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(CacheError::Configuration(format!(
                "pool min size {} exceeds max size {}",
                self.min_size, self.max_size
            )));
        }
        if self.idle_lifetime < self.pruning_interval {
            return Err(CacheError::Configuration(format!(
                "pool idle lifetime {:?} must be >= pruning interval {:?}",
                self.idle_lifetime, self.pruning_interval
            )));
        }
        Ok(())
    }
}

// == Resilience Options ==
/// Retry, circuit breaker and timeout knobs.
#[derive(Debug, Clone)]
pub struct ResilienceOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing
    pub break_duration: Duration,
    pub operation_timeout: Duration,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub connection_failure_log_level: Level,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: BackoffStrategy::ExponentialWithJitter,
            circuit_breaker_enabled: false,
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            connection_failure_log_level: Level::WARN,
        }
    }
}

impl ResilienceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CacheError::Configuration(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker_enabled && self.failure_threshold == 0 {
            return Err(CacheError::Configuration(
                "circuit breaker failure threshold must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("operation timeout", self.operation_timeout),
            ("connection timeout", self.connection_timeout),
            ("command timeout", self.command_timeout),
        ] {
            if value.is_zero() {
                return Err(CacheError::Configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

// == Cache Options ==
/// Complete configuration snapshot for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub connection_string: String,
    pub target: TableTarget,
    pub create_infrastructure: bool,
    pub infrastructure_lock_timeout: Duration,
    pub infrastructure_poll_interval: Duration,
    pub pool: PoolOptions,
    pub enable_automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub cleanup_batch_size: u32,
    pub enable_manager_election: bool,
    pub election_interval: Duration,
    pub resilience: ResilienceOptions,
    /// Lower clamp for converted absolute expirations
    pub min_expiration: Duration,
    /// Upper clamp for converted absolute expirations
    pub max_expiration: Duration,
    /// Applied to writes that carry no expiration policy
    pub default_sliding_expiration: Option<Duration>,
    /// Connection string parameters masked in logs
    pub sensitive_parameters: Vec<String>,
    pub serializer: SerializerKind,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            target: TableTarget::new("public", "cache_entries"),
            create_infrastructure: true,
            infrastructure_lock_timeout: Duration::from_secs(30),
            infrastructure_poll_interval: Duration::from_millis(250),
            pool: PoolOptions::default(),
            enable_automatic_cleanup: true,
            cleanup_interval: Duration::from_secs(30),
            cleanup_batch_size: 1000,
            enable_manager_election: true,
            election_interval: Duration::from_secs(15),
            resilience: ResilienceOptions::default(),
            min_expiration: Duration::from_secs(1),
            max_expiration: Duration::from_secs(365 * 24 * 60 * 60),
            default_sliding_expiration: None,
            sensitive_parameters: vec!["password".to_string()],
            serializer: SerializerKind::TextualJson,
        }
    }
}

impl CacheOptions {
    /// Creates options by loading values from `PGCACHE_*` environment variables.
    ///
    /// # Environment Variables
    /// - `PGCACHE_CONNECTION_STRING` - PostgreSQL connection string (required)
    /// - `PGCACHE_SCHEMA` / `PGCACHE_TABLE` - target table (default: public.cache_entries)
    /// - `PGCACHE_CREATE_INFRASTRUCTURE` - create schema/table on startup (default: true)
    /// - `PGCACHE_POOL_MIN` / `PGCACHE_POOL_MAX` - pool size (default: 1 / 10)
    /// - `PGCACHE_POOL_IDLE_LIFETIME_SECS` / `PGCACHE_POOL_PRUNING_INTERVAL_SECS`
    /// - `PGCACHE_CLEANUP_ENABLED` / `PGCACHE_CLEANUP_INTERVAL_SECS` / `PGCACHE_CLEANUP_BATCH_SIZE`
    /// - `PGCACHE_ELECTION_ENABLED` / `PGCACHE_ELECTION_INTERVAL_SECS`
    /// - `PGCACHE_MAX_ATTEMPTS` / `PGCACHE_BASE_DELAY_MS` / `PGCACHE_BACKOFF`
    /// - `PGCACHE_CIRCUIT_BREAKER` / `PGCACHE_FAILURE_THRESHOLD` / `PGCACHE_BREAK_DURATION_SECS`
    /// - `PGCACHE_OPERATION_TIMEOUT_MS` / `PGCACHE_CONNECTION_TIMEOUT_MS` / `PGCACHE_COMMAND_TIMEOUT_MS`
    /// - `PGCACHE_MIN_EXPIRATION_SECS` / `PGCACHE_MAX_EXPIRATION_SECS`
    /// - `PGCACHE_DEFAULT_SLIDING_SECS`
    /// - `PGCACHE_SERIALIZER` - `json` or `binary`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let resilience = ResilienceOptions {
            max_attempts: env_or("MAX_ATTEMPTS", defaults.resilience.max_attempts),
            base_delay: env_millis("BASE_DELAY_MS", defaults.resilience.base_delay),
            max_delay: env_millis("MAX_DELAY_MS", defaults.resilience.max_delay),
            backoff: env_or("BACKOFF", defaults.resilience.backoff),
            circuit_breaker_enabled: env_or(
                "CIRCUIT_BREAKER",
                defaults.resilience.circuit_breaker_enabled,
            ),
            failure_threshold: env_or("FAILURE_THRESHOLD", defaults.resilience.failure_threshold),
            break_duration: env_secs("BREAK_DURATION_SECS", defaults.resilience.break_duration),
            operation_timeout: env_millis(
                "OPERATION_TIMEOUT_MS",
                defaults.resilience.operation_timeout,
            ),
            connection_timeout: env_millis(
                "CONNECTION_TIMEOUT_MS",
                defaults.resilience.connection_timeout,
            ),
            command_timeout: env_millis("COMMAND_TIMEOUT_MS", defaults.resilience.command_timeout),
            connection_failure_log_level: env_or(
                "CONNECTION_FAILURE_LOG_LEVEL",
                defaults.resilience.connection_failure_log_level,
            ),
        };

        let pool = PoolOptions {
            min_size: env_or("POOL_MIN", defaults.pool.min_size),
            max_size: env_or("POOL_MAX", defaults.pool.max_size),
            idle_lifetime: env_secs("POOL_IDLE_LIFETIME_SECS", defaults.pool.idle_lifetime),
            pruning_interval: env_secs(
                "POOL_PRUNING_INTERVAL_SECS",
                defaults.pool.pruning_interval,
            ),
            pooling_enabled: env_or("POOLING_ENABLED", defaults.pool.pooling_enabled),
        };

        Self {
            connection_string: env_or("CONNECTION_STRING", defaults.connection_string),
            target: TableTarget::new(
                env_or("SCHEMA", defaults.target.schema),
                env_or("TABLE", defaults.target.table),
            ),
            create_infrastructure: env_or(
                "CREATE_INFRASTRUCTURE",
                defaults.create_infrastructure,
            ),
            infrastructure_lock_timeout: env_secs(
                "INFRASTRUCTURE_LOCK_TIMEOUT_SECS",
                defaults.infrastructure_lock_timeout,
            ),
            infrastructure_poll_interval: defaults.infrastructure_poll_interval,
            pool,
            enable_automatic_cleanup: env_or("CLEANUP_ENABLED", defaults.enable_automatic_cleanup),
            cleanup_interval: env_secs("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            cleanup_batch_size: env_or("CLEANUP_BATCH_SIZE", defaults.cleanup_batch_size),
            enable_manager_election: env_or(
                "ELECTION_ENABLED",
                defaults.enable_manager_election,
            ),
            election_interval: env_secs("ELECTION_INTERVAL_SECS", defaults.election_interval),
            resilience,
            min_expiration: env_secs("MIN_EXPIRATION_SECS", defaults.min_expiration),
            max_expiration: env_secs("MAX_EXPIRATION_SECS", defaults.max_expiration),
            default_sliding_expiration: env::var(format!("{ENV_PREFIX}DEFAULT_SLIDING_SECS"))
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            sensitive_parameters: env::var(format!("{ENV_PREFIX}SENSITIVE_PARAMETERS"))
                .ok()
                .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or(defaults.sensitive_parameters),
            serializer: env_or("SERIALIZER", defaults.serializer),
        }
    }

    /// Validates the whole snapshot. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(CacheError::Configuration(
                "connection string is required".to_string(),
            ));
        }
        self.validate_without_connection()
    }

    /// Validates everything except the connection string, for in-memory data sources.
    pub fn validate_without_connection(&self) -> Result<()> {
        self.target.validate()?;
        self.pool.validate()?;
        self.resilience.validate()?;

        if self.min_expiration.is_zero() {
            return Err(CacheError::Configuration(
                "minimum expiration must be non-zero".to_string(),
            ));
        }
        if self.min_expiration > self.max_expiration {
            return Err(CacheError::Configuration(format!(
                "minimum expiration {:?} exceeds maximum {:?}",
                self.min_expiration, self.max_expiration
            )));
        }
        if self.cleanup_batch_size == 0 {
            return Err(CacheError::Configuration(
                "cleanup batch size must be at least 1".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() || self.election_interval.is_zero() {
            return Err(CacheError::Configuration(
                "cleanup and election intervals must be non-zero".to_string(),
            ));
        }
        if matches!(self.default_sliding_expiration, Some(d) if d.is_zero()) {
            return Err(CacheError::Configuration(
                "default sliding expiration must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// == Helpers ==
fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(CacheError::Configuration(format!(
            "invalid {what} '{value}': expected letters, digits and underscores, at most 63 bytes"
        )))
    }
}

/// Reads `PGCACHE_<name>`. A value that does not parse is ignored with a warning.
fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    let variable = format!("{ENV_PREFIX}{name}");
    let raw = env::var(&variable).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = %variable, value = %raw, "Unparseable configuration value, using default");
            None
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env_parsed(name).unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_parsed(name).map(Duration::from_secs).unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_parsed(name).map(Duration::from_millis).unwrap_or(default)
}
