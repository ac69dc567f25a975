//! Cache Entry Module
//!
//! Defines the persisted record and the per-call expiration policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::time::ResolvedExpiration;

// == Cache Record ==
/// One row of the cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_interval: Option<Duration>,
    /// Earliest instant the record is stale; the only column compared for expiry
    pub next_expiration: DateTime<Utc>,
    /// Diagnostic label, e.g. the Rust type of a typed write
    pub value_type: Option<String>,
}

impl CacheRecord {
    // == Constructor ==
    /// Creates a record from resolved expiration columns.
    pub fn new(
        key: String,
        value: Vec<u8>,
        expiration: ResolvedExpiration,
        value_type: Option<String>,
    ) -> Self {
        Self {
            key,
            value,
            absolute_expiration: expiration.absolute,
            sliding_interval: expiration.sliding,
            next_expiration: expiration.next,
            value_type,
        }
    }

    // == Is Expired ==
    /// Boundary condition: a record whose `next_expiration` equals `now` is expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_expiration
    }
}

// == Expiration Policy ==
/// How long a write should live. Empty means "no expiration" unless the
/// cache has a default sliding expiration configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    /// Fixed instant after which the entry is expired
    pub absolute: Option<DateTime<Utc>>,
    /// Fixed lifetime from the time of the write
    pub relative_to_now: Option<Duration>,
    /// Lifetime extended on every successful read
    pub sliding: Option<Duration>,
}

impl ExpirationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absolute_at(mut self, at: DateTime<Utc>) -> Self {
        self.absolute = Some(at);
        self
    }

    pub fn expire_after(mut self, after: Duration) -> Self {
        self.relative_to_now = Some(after);
        self
    }

    pub fn sliding(mut self, window: Duration) -> Self {
        self.sliding = Some(window);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.absolute.is_none() && self.relative_to_now.is_none() && self.sliding.is_none()
    }
}
