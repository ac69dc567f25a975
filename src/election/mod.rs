//! Election Module
//!
//! Cross-process manager election over PostgreSQL advisory locks.

mod service;

pub use service::{ElectionEvent, ManagerElection};
