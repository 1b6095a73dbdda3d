//! # origin
//!
//! Event origins and phase arrivals carried on the origin buses.

use serde::{Deserialize, Serialize};

use crate::frame::{Message, WireError};

// ── Tagged enumerations ───────────────────────────────────────────────────────

/// Seismic phase of a pick or arrival. Wire tag: 0 = P, 1 = S.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    #[default]
    P,
    S,
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        match phase {
            Phase::P => 0,
            Phase::S => 1,
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Phase::P),
            1 => Ok(Phase::S),
            other => Err(format!("unknown phase tag {other}")),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::P => write!(f, "P"),
            Phase::S => write!(f, "S"),
        }
    }
}

/// Monitoring region an origin belongs to. A locator instance serves
/// exactly one region and drops origins from any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MonitoringRegion {
    #[default]
    Unknown,
    Utah,
    Yellowstone,
}

impl From<MonitoringRegion> for u8 {
    fn from(region: MonitoringRegion) -> u8 {
        match region {
            MonitoringRegion::Unknown => 0,
            MonitoringRegion::Utah => 1,
            MonitoringRegion::Yellowstone => 2,
        }
    }
}

impl TryFrom<u8> for MonitoringRegion {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MonitoringRegion::Unknown),
            1 => Ok(MonitoringRegion::Utah),
            2 => Ok(MonitoringRegion::Yellowstone),
            other => Err(format!("unknown monitoring region tag {other}")),
        }
    }
}

/// Coarse event classification. Quarry blasts are located with the depth
/// fixed to the free surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventType {
    #[default]
    Unknown,
    Earthquake,
    QuarryBlast,
}

impl From<EventType> for u8 {
    fn from(event_type: EventType) -> u8 {
        match event_type {
            EventType::Unknown => 0,
            EventType::Earthquake => 1,
            EventType::QuarryBlast => 2,
        }
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(EventType::Unknown),
            1 => Ok(EventType::Earthquake),
            2 => Ok(EventType::QuarryBlast),
            other => Err(format!("unknown event type tag {other}")),
        }
    }
}

/// Whether a human has reviewed the origin. Everything in this tier is
/// automatic; the flag rides along for downstream consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ReviewStatus {
    #[default]
    Automatic,
    Reviewed,
}

impl From<ReviewStatus> for u8 {
    fn from(status: ReviewStatus) -> u8 {
        match status {
            ReviewStatus::Automatic => 0,
            ReviewStatus::Reviewed => 1,
        }
    }
}

impl TryFrom<u8> for ReviewStatus {
    type Error = String;
    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(ReviewStatus::Automatic),
            1 => Ok(ReviewStatus::Reviewed),
            other => Err(format!("unknown review status tag {other}")),
        }
    }
}

// ── Arrival ───────────────────────────────────────────────────────────────────

/// An observed phase pick at a station, attached to an origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arrival {
    pub network: String,
    pub station: String,
    /// Channel the pick was made on, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_code: Option<String>,
    pub phase: Phase,
    /// Pick time, microseconds since the epoch
    pub time_us: i64,
    /// Pick standard error in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_error_s: Option<f64>,
    /// Catalog arrival identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<i64>,
    /// Identifier of the origin this arrival is associated with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_identifier: Option<i64>,
    /// Modeled travel time in seconds, when a locator has produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_time_s: Option<f64>,
    /// observed − (origin time + travel time), seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_s: Option<f64>,
}

impl Arrival {
    /// Dotted name "NET.STA.P" style, for logs.
    pub fn name(&self) -> String {
        format!("{}.{}.{}", self.network, self.station, self.phase)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.network.is_empty() {
            return Err(WireError::Invalid("arrival network is empty".to_string()));
        }
        if self.station.is_empty() {
            return Err(WireError::Invalid("arrival station is empty".to_string()));
        }
        Ok(())
    }
}

// ── Origin ────────────────────────────────────────────────────────────────────

/// A located (or preliminary) event hypothesis with its arrivals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub identifier: i64,
    /// Origin time, microseconds since the epoch
    pub time_us: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Depth below the free surface in meters
    pub depth_m: f64,
    #[serde(default)]
    pub arrivals: Vec<Arrival>,
    #[serde(default)]
    pub monitoring_region: MonitoringRegion,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub review_status: ReviewStatus,
    /// Identifiers this origin superseded, oldest first
    #[serde(default)]
    pub previous_identifiers: Vec<i64>,
    /// Names of the modules that have touched this origin, in order
    #[serde(default)]
    pub algorithms: Vec<String>,
}

impl Message for Origin {
    const MESSAGE_TYPE: &'static str = "Seismon::Broadcasts::Origin";
}

impl Origin {
    pub fn time_s(&self) -> f64 {
        crate::micros_to_seconds(self.time_us)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(WireError::Invalid(format!(
                "origin latitude {} out of range",
                self.latitude
            )));
        }
        if !(-180.0..=360.0).contains(&self.longitude) {
            return Err(WireError::Invalid(format!(
                "origin longitude {} out of range",
                self.longitude
            )));
        }
        for arrival in &self.arrivals {
            arrival.validate()?;
        }
        Ok(())
    }
}
