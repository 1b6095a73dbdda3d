//! # channel
//!
//! Channel metadata as served by the catalog: per-channel descriptors and the
//! three-component groups the detector pipeline runs on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::frame::WireError;

/// Geographic fields are considered equal within this tolerance when
/// comparing catalog snapshots.
pub const GEOGRAPHIC_TOLERANCE_DEGREES: f64 = 1.0e-7;

/// Sampling rates within this tolerance are treated as identical.
pub const SAMPLING_RATE_TOLERANCE_HZ: f64 = 1.0e-5;

// ── Channel descriptor ────────────────────────────────────────────────────────

/// One row of the channel catalog.
///
/// Identity is the (network, station, channel, location_code) 4-tuple; a
/// channel is live at time T iff `on_date_us <= T < off_date_us`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location_code: String,
    /// Nominal sampling rate in Hz
    pub sampling_rate: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters
    pub elevation: f64,
    /// Dip in degrees from horizontal
    pub dip: f64,
    /// Azimuth in degrees clockwise from north
    pub azimuth: f64,
    /// Epoch start, microseconds
    pub on_date_us: i64,
    /// Epoch end, microseconds (exclusive)
    pub off_date_us: i64,
    /// When this row was loaded into the catalog, microseconds
    pub load_date_us: i64,
}

impl ChannelDescriptor {
    /// The identity 4-tuple as an owned key.
    pub fn identity(&self) -> (String, String, String, String) {
        (
            self.network.clone(),
            self.station.clone(),
            self.channel.clone(),
            self.location_code.clone(),
        )
    }

    /// Dotted name "NET.STA.CHA.LOC".
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }

    /// True iff the epoch covers T.
    pub fn is_live_at(&self, time_us: i64) -> bool {
        self.on_date_us <= time_us && time_us < self.off_date_us
    }

    /// Location code with empty/blank codes normalized to "--", the form
    /// used in emitted names and outgoing requests.
    pub fn location_or_default(&self) -> String {
        let trimmed = self.location_code.trim();
        if trimmed.is_empty() {
            "--".to_string()
        } else {
            self.location_code.clone()
        }
    }

    /// Snapshot equality: identity and time fields exact, geographic and
    /// orientation fields within [`GEOGRAPHIC_TOLERANCE_DEGREES`].
    pub fn approx_eq(&self, other: &Self) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= GEOGRAPHIC_TOLERANCE_DEGREES;
        self.network == other.network
            && self.station == other.station
            && self.channel == other.channel
            && self.location_code == other.location_code
            && (self.sampling_rate - other.sampling_rate).abs() <= SAMPLING_RATE_TOLERANCE_HZ
            && close(self.latitude, other.latitude)
            && close(self.longitude, other.longitude)
            && close(self.elevation, other.elevation)
            && close(self.dip, other.dip)
            && close(self.azimuth, other.azimuth)
            && self.on_date_us == other.on_date_us
            && self.off_date_us == other.off_date_us
            && self.load_date_us == other.load_date_us
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.network.is_empty()
            || self.station.is_empty()
            || self.channel.is_empty()
        {
            return Err(WireError::Invalid(format!(
                "incomplete channel identity {:?}",
                self.name()
            )));
        }
        if !(self.sampling_rate > 0.0) {
            return Err(WireError::Invalid(format!(
                "{}: sampling rate {} is not positive",
                self.name(),
                self.sampling_rate
            )));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(WireError::Invalid(format!(
                "{}: latitude {} out of range",
                self.name(),
                self.latitude
            )));
        }
        if !(-180.0..=360.0).contains(&self.longitude) {
            return Err(WireError::Invalid(format!(
                "{}: longitude {} out of range",
                self.name(),
                self.longitude
            )));
        }
        if self.on_date_us >= self.off_date_us {
            return Err(WireError::Invalid(format!(
                "{}: on date is not before off date",
                self.name()
            )));
        }
        Ok(())
    }
}

/// Stable 64-bit digest of a sensor name. SipHash in std is seeded per
/// process; the sensor table key must be reproducible across restarts, so
/// this uses the first eight bytes of a SHA-256 instead.
pub fn stable_name_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

// ── Three-component group ─────────────────────────────────────────────────────

/// An ordered (vertical, north, east) triple of channels from one station.
///
/// All three share (network, station, location_code) and sampling rate, and
/// the channel codes agree in their first two characters, differing only in
/// the final component character (e.g. HHZ / HHN / HHE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeComponentGroup {
    pub vertical: ChannelDescriptor,
    pub north: ChannelDescriptor,
    pub east: ChannelDescriptor,
}

impl ThreeComponentGroup {
    pub fn new(
        vertical: ChannelDescriptor,
        north: ChannelDescriptor,
        east: ChannelDescriptor,
    ) -> Result<Self, WireError> {
        if vertical.network != north.network || vertical.network != east.network {
            return Err(WireError::Invalid("inconsistent networks".to_string()));
        }
        if vertical.station != north.station || vertical.station != east.station {
            return Err(WireError::Invalid("inconsistent stations".to_string()));
        }
        if vertical.location_code != north.location_code
            || vertical.location_code != east.location_code
        {
            return Err(WireError::Invalid("inconsistent location codes".to_string()));
        }
        if (vertical.sampling_rate - north.sampling_rate).abs() > SAMPLING_RATE_TOLERANCE_HZ
            || (vertical.sampling_rate - east.sampling_rate).abs() > SAMPLING_RATE_TOLERANCE_HZ
        {
            return Err(WireError::Invalid("inconsistent sampling rates".to_string()));
        }
        if vertical.channel == north.channel || vertical.channel == east.channel {
            return Err(WireError::Invalid("duplicate channel code".to_string()));
        }
        let prefix = |c: &str| c[..c.len().saturating_sub(1)].to_string();
        if vertical.channel.len() < 3 || north.channel.len() < 3 || east.channel.len() < 3 {
            return Err(WireError::Invalid("channel code too short".to_string()));
        }
        if prefix(&vertical.channel) != prefix(&north.channel)
            || prefix(&vertical.channel) != prefix(&east.channel)
        {
            return Err(WireError::Invalid(
                "inconsistent channel code prefixes".to_string(),
            ));
        }
        Ok(Self {
            vertical,
            north,
            east,
        })
    }

    pub fn network(&self) -> &str {
        &self.vertical.network
    }

    pub fn station(&self) -> &str {
        &self.vertical.station
    }

    pub fn location_code(&self) -> &str {
        &self.vertical.location_code
    }

    pub fn location_or_default(&self) -> String {
        self.vertical.location_or_default()
    }

    pub fn nominal_sampling_rate(&self) -> f64 {
        self.vertical.sampling_rate
    }

    /// Shared two-character band/instrument prefix, e.g. "HH".
    pub fn band_prefix(&self) -> &str {
        &self.vertical.channel[..2]
    }

    /// Display name "NET.STA.HH[ZNE].LOC".
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}[{}{}{}].{}",
            self.network(),
            self.station(),
            self.band_prefix(),
            last_char(&self.vertical.channel),
            last_char(&self.north.channel),
            last_char(&self.east.channel),
            self.location_or_default()
        )
    }

    /// Identity key in the scheduler's sensor table: a deterministic digest
    /// of the five naming strings.
    pub fn hash(&self) -> u64 {
        let key = format!(
            "{}.{}.{}.{}.{}.{}",
            self.network(),
            self.station(),
            self.vertical.channel,
            self.north.channel,
            self.east.channel,
            self.location_code()
        );
        stable_name_hash(&key)
    }
}

fn last_char(code: &str) -> char {
    code.chars().next_back().unwrap_or('?')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(channel: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: channel.to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            latitude: 38.92,
            longitude: -111.17,
            elevation: 2125.0,
            dip: -90.0,
            azimuth: 0.0,
            on_date_us: 0,
            off_date_us: i64::MAX,
            load_date_us: 0,
        }
    }

    fn group() -> ThreeComponentGroup {
        ThreeComponentGroup::new(descriptor("HHZ"), descriptor("HHN"), descriptor("HHE")).unwrap()
    }

    #[test]
    fn group_requires_matching_prefixes() {
        let err = ThreeComponentGroup::new(descriptor("HHZ"), descriptor("ENN"), descriptor("HHE"));
        assert!(err.is_err());
    }

    #[test]
    fn group_rejects_duplicate_channels() {
        let err = ThreeComponentGroup::new(descriptor("HHZ"), descriptor("HHZ"), descriptor("HHE"));
        assert!(err.is_err());
    }

    #[test]
    fn group_rejects_mixed_stations() {
        let mut north = descriptor("HHN");
        north.station = "WPUT".to_string();
        assert!(ThreeComponentGroup::new(descriptor("HHZ"), north, descriptor("HHE")).is_err());
    }

    #[test]
    fn group_name_and_prefix() {
        let g = group();
        assert_eq!(g.band_prefix(), "HH");
        assert_eq!(g.name(), "UU.CVRU.HH[ZNE].01");
    }

    #[test]
    fn hash_is_stable_and_identity_sensitive() {
        let g = group();
        assert_eq!(g.hash(), group().hash());
        let mut other = group();
        other.vertical.station = "WPUT".to_string();
        other.north.station = "WPUT".to_string();
        other.east.station = "WPUT".to_string();
        assert_ne!(g.hash(), other.hash());
    }

    #[test]
    fn live_window_is_half_open() {
        let mut d = descriptor("HHZ");
        d.on_date_us = 100;
        d.off_date_us = 200;
        assert!(!d.is_live_at(99));
        assert!(d.is_live_at(100));
        assert!(d.is_live_at(199));
        assert!(!d.is_live_at(200));
    }

    #[test]
    fn blank_location_code_normalizes() {
        let mut d = descriptor("HHZ");
        d.location_code = "  ".to_string();
        assert_eq!(d.location_or_default(), "--");
        d.location_code = "01".to_string();
        assert_eq!(d.location_or_default(), "01");
    }

    #[test]
    fn approx_eq_tolerates_tiny_geographic_drift() {
        let a = descriptor("HHZ");
        let mut b = descriptor("HHZ");
        b.latitude += 0.5e-7;
        assert!(a.approx_eq(&b));
        b.latitude += 1.0e-6;
        assert!(!a.approx_eq(&b));
        let mut c = descriptor("HHZ");
        c.on_date_us += 1;
        assert!(!a.approx_eq(&c));
    }
}
