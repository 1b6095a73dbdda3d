//! # packet
//!
//! Waveform and probability packets carried on the broadcast buses.

use serde::{Deserialize, Serialize};

use crate::frame::{Message, WireError};
use crate::MICROSECONDS_PER_SECOND;

// ── Waveform packet ───────────────────────────────────────────────────────────

/// A contiguous waveform chunk for one channel, as served by the packet cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Network code, e.g. "UU"
    pub network: String,
    /// Station name, e.g. "WPUT"
    pub station: String,
    /// Channel code, e.g. "HHZ"
    pub channel: String,
    /// Location code, e.g. "01"
    pub location_code: String,
    /// Sampling rate in Hz
    pub sampling_rate: f64,
    /// UTC start time of the first sample, microseconds since the epoch
    pub start_time_us: i64,
    /// Sample values
    pub data: Vec<f64>,
}

impl Message for Packet {
    const MESSAGE_TYPE: &'static str = "Seismon::Broadcasts::DataPacket";
}

impl Packet {
    /// Sample spacing in microseconds (may be fractional for odd rates).
    pub fn sample_spacing_us(&self) -> f64 {
        MICROSECONDS_PER_SECOND / self.sampling_rate
    }

    /// UTC time of the last sample: start + (N-1)/rate.
    pub fn end_time_us(&self) -> i64 {
        if self.data.is_empty() {
            return self.start_time_us;
        }
        let span = (self.data.len() - 1) as f64 * self.sample_spacing_us();
        self.start_time_us + span.round() as i64
    }

    /// Dotted sensor name, "NET.STA.CHA.LOC".
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }

    /// Checks the documented packet preconditions: non-empty naming strings,
    /// a positive sampling rate, and at least one sample.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.network.is_empty() {
            return Err(WireError::Invalid("network is empty".to_string()));
        }
        if self.station.is_empty() {
            return Err(WireError::Invalid("station is empty".to_string()));
        }
        if self.channel.is_empty() {
            return Err(WireError::Invalid("channel is empty".to_string()));
        }
        if self.location_code.is_empty() {
            return Err(WireError::Invalid("location code is empty".to_string()));
        }
        if !(self.sampling_rate > 0.0) {
            return Err(WireError::Invalid(format!(
                "sampling rate {} is not positive",
                self.sampling_rate
            )));
        }
        if self.data.is_empty() {
            return Err(WireError::Invalid("packet has no samples".to_string()));
        }
        Ok(())
    }
}

// ── Probability packet ────────────────────────────────────────────────────────

/// A detector's per-sample probability stream for one emitted channel.
///
/// Identity mirrors [`Packet`]; the extra fields record which raw channels
/// fed the detector and which binary classification produced the values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityPacket {
    pub network: String,
    pub station: String,
    /// Emitted channel, e.g. "HHP": band/instrument prefix + positive class
    pub channel: String,
    pub location_code: String,
    /// Sampling rate of the probability trace in Hz (typically 100)
    pub sampling_rate: f64,
    /// UTC start time of the first probability sample, microseconds
    pub start_time_us: i64,
    /// Probability values in [0, 1]
    pub data: Vec<f64>,
    /// Raw channels the detector consumed, e.g. ["HHZ", "HHN", "HHE"]
    #[serde(default)]
    pub original_channels: Vec<String>,
    /// Positive class name, e.g. "P"
    #[serde(default)]
    pub positive_class: String,
    /// Negative class name, e.g. "Noise"
    #[serde(default)]
    pub negative_class: String,
    /// Algorithm tag, e.g. "UNetThreeComponentP"
    #[serde(default)]
    pub algorithm: String,
}

impl Message for ProbabilityPacket {
    const MESSAGE_TYPE: &'static str = "Seismon::Broadcasts::ProbabilityPacket";
}

impl ProbabilityPacket {
    pub fn sample_spacing_us(&self) -> f64 {
        MICROSECONDS_PER_SECOND / self.sampling_rate
    }

    /// UTC time of the last sample: start + (N-1)/rate.
    pub fn end_time_us(&self) -> i64 {
        if self.data.is_empty() {
            return self.start_time_us;
        }
        let span = (self.data.len() - 1) as f64 * self.sample_spacing_us();
        self.start_time_us + span.round() as i64
    }

    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.channel, self.location_code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn packet() -> Packet {
        Packet {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: "HHZ".to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            start_time_us: 1_729_851_505_000_000,
            data: vec![0.5, -0.25, 1.75],
        }
    }

    #[test]
    fn end_time_is_start_plus_n_minus_one_over_rate() {
        let p = packet();
        assert_eq!(p.end_time_us(), p.start_time_us + 20_000);
    }

    #[test]
    fn single_sample_packet_has_zero_span() {
        let mut p = packet();
        p.data = vec![1.0];
        assert_eq!(p.end_time_us(), p.start_time_us);
    }

    #[test]
    fn validation_rejects_bad_packets() {
        let mut p = packet();
        p.sampling_rate = 0.0;
        assert!(p.validate().is_err());
        let mut p = packet();
        p.network.clear();
        assert!(p.validate().is_err());
        let mut p = packet();
        p.data.clear();
        assert!(p.validate().is_err());
        assert!(packet().validate().is_ok());
    }

    #[test]
    fn packet_cbor_round_trip() {
        let p = packet();
        let bytes = frame::encode(&p).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(bytes)).unwrap();
        let decoded: Packet = envelope.unpack().unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn probability_packet_cbor_round_trip() {
        let p = ProbabilityPacket {
            network: "UU".to_string(),
            station: "CVRU".to_string(),
            channel: "HHP".to_string(),
            location_code: "01".to_string(),
            sampling_rate: 100.0,
            start_time_us: 1_729_851_507_540_000,
            data: vec![0.0, 0.25, 0.5, 1.0],
            original_channels: vec!["HHZ".into(), "HHN".into(), "HHE".into()],
            positive_class: "P".to_string(),
            negative_class: "Noise".to_string(),
            algorithm: "UNetThreeComponentP".to_string(),
        };
        let bytes = frame::encode(&p).unwrap();
        let envelope = frame::read_frame(&mut std::io::Cursor::new(bytes)).unwrap();
        let decoded: ProbabilityPacket = envelope.unpack().unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.end_time_us(), p.start_time_us + 30_000);
    }
}
