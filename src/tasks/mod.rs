//! Background Tasks Module
//!
//! Contains services that run periodically alongside the cache.
//!
//! # Tasks
//! - Cleanup: deletes expired cache entries in bounded batches

mod cleanup;

pub use cleanup::{CleanupOutcome, CleanupService};
