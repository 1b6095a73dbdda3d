//! # seis-simulator
//!
//! Development and test harness for the seismon backend: synthetic
//! digitizer waveforms, TOML scenarios, and wire-accurate mock versions of
//! every remote service the backend talks to (packet cache, detectors,
//! locator, incrementer, broadcast buses).
//!
//! The `seis-sim` binary stands up a complete fake field so the real
//! daemons can be pointed at localhost; the library half is consumed by the
//! backend's integration tests.

pub mod mock;
pub mod scenario;
pub mod waveform;

pub use mock::{
    spawn_broadcast_feed, spawn_capture_bus, spawn_detector, spawn_incrementer, spawn_locator,
    spawn_origin_feed, spawn_packet_cache, CapturedFrames, DetectorBehavior, LocatorBehavior,
    PacketStore, ServiceHandle,
};
pub use scenario::{Scenario, StationSpec};
pub use waveform::SyntheticChannel;
