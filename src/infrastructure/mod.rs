//! Infrastructure Module
//!
//! Idempotent, cross-process creation of the cache schema objects.

mod schema;

pub use schema::{EnsureOutcome, InfrastructureState, SchemaManager};
