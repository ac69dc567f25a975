//! Time Module
//!
//! Injectable clocks and the expiration converter.

mod clock;
mod converter;

pub use clock::{add_saturating, far_future, Clock, ManualClock, SharedClock, SystemClock};
pub use converter::{next_expiration, ExpirationConverter, ResolvedExpiration};
