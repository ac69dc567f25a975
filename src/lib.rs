//! pg_cache - A distributed cache backed by PostgreSQL
//!
//! Stores byte values with absolute and sliding expiration in one table
//! shared by every process. Coordination between processes (schema
//! bootstrap, which instance runs cleanup) happens through advisory locks.

pub mod cache;
pub mod config;
pub mod datasource;
pub mod election;
pub mod error;
pub mod infrastructure;
pub mod resilience;
pub mod tasks;
pub mod time;

pub use cache::{CacheItem, DistributedCache, ExpirationPolicy};
pub use config::CacheOptions;
pub use datasource::{DataSource, MemoryDataSource, PgDataSource};
pub use election::{ElectionEvent, ManagerElection};
pub use error::{CacheError, Result};
pub use infrastructure::EnsureOutcome;
pub use tasks::{CleanupOutcome, CleanupService};
