//! # seis-types
//!
//! Shared wire types for the seismon real-time processing tier.
//!
//! These types are used by:
//! - `seismon-backend`: the detector pipeline and locator orchestrator daemons
//! - `seis-simulator`: the synthetic digitizer and mock-service harness
//! - any external service speaking the broker's framing
//!
//! ## Wire conventions
//!
//! - All times are UTC, signed 64-bit **microseconds** since the Unix epoch.
//! - All sampling rates are positive f64 Hz.
//! - Every message travels as a length-prefixed frame carrying the message
//!   type string, a schema version string, and a CBOR payload (see [`frame`]).
//! - Small closed sets (phases, return codes, strategies) are integer tags on
//!   the wire and Rust enums in memory.

pub mod channel;
pub mod frame;
pub mod messages;
pub mod origin;
pub mod packet;

pub use channel::{ChannelDescriptor, ThreeComponentGroup};
pub use frame::{Envelope, Message, WireError};
pub use origin::{Arrival, EventType, MonitoringRegion, Origin, Phase, ReviewStatus};
pub use packet::{Packet, ProbabilityPacket};

/// One million microseconds per second; the conversion shows up everywhere.
pub const MICROSECONDS_PER_SECOND: f64 = 1.0e6;

/// Converts epoch seconds to epoch microseconds, rounding to the nearest tick.
pub fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * MICROSECONDS_PER_SECOND).round() as i64
}

/// Converts epoch microseconds to epoch seconds.
pub fn micros_to_seconds(micros: i64) -> f64 {
    micros as f64 / MICROSECONDS_PER_SECOND
}

/// Renders any wire message as indented JSON for log and debug output.
/// The wire encoding itself is always CBOR; this is never sent.
pub fn to_debug_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_micro_round_trip() {
        assert_eq!(seconds_to_micros(1729851505.246174), 1729851505246174);
        assert!((micros_to_seconds(1729851505246174) - 1729851505.246174).abs() < 1e-9);
    }

    #[test]
    fn negative_times_round_trip() {
        assert_eq!(seconds_to_micros(-1.5), -1_500_000);
        assert_eq!(micros_to_seconds(-1_500_000), -1.5);
    }
}
