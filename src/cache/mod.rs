//! Cache Module
//!
//! Provides the distributed cache engine, its record and expiration types,
//! value serializers and statistics.

mod engine;
mod entry;
mod serializer;
mod stats;


// Re-export public types
pub use engine::{CacheItem, DistributedCache};
pub use entry::{CacheRecord, ExpirationPolicy};
pub use serializer::{
    BincodeSerializer, JsonSerializer, Serializer, SerializerKind, ValueSerializer,
};
pub use stats::CacheStats;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 449;
