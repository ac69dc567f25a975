//! Resilience Module
//!
//! Timeouts, retry with backoff and an optional circuit breaker around every
//! database call.

mod backoff;
mod circuit_breaker;
mod pipeline;

pub use backoff::BackoffStrategy;
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use pipeline::ResiliencePipeline;
