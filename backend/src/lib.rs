//! # seismon-backend
//!
//! The real-time processing tier of the seismon earthquake monitoring
//! system: the ML detector pipeline (`seismon-detector`) and the locator
//! orchestrator (`seismon-locator`).
//!
//! Both daemons are plain OS-thread programs. Pipeline workers each own a
//! partition of per-sensor state machines and drive them in a round-robin
//! loop; the locator runs subscriber / locate / publish threads joined by
//! bounded queues. Every blocking call is bounded by a configured timeout
//! and every sleep is a condition-variable wait, so shutdown is prompt.

pub mod broadcast;
pub mod cache_client;
pub mod config;
pub mod directory;
pub mod error;
pub mod inference;
pub mod interpolator;
pub mod locator;
pub mod scheduler;
pub mod sensor;
pub mod shutdown;
pub mod transport;

pub use error::{Error, Result};
pub use shutdown::Shutdown;

/// Current UTC wall clock in microseconds since the epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
